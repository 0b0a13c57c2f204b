use std::{
    fs::File,
    io::{self, BufRead},
    path::Path,
};

/// Reads class labels, one per line, in model output order.
pub fn load_class_labels(filepath: &Path) -> io::Result<Vec<String>> {
    let file = File::open(filepath)?;
    let reader = io::BufReader::new(file);
    let mut labels = Vec::new();

    for line_result in reader.lines() {
        let line = line_result?;
        let label = line.trim();
        if label.is_empty() {
            continue;
        }
        labels.push(label.to_string());
    }

    if labels.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("No labels found in {}", filepath.display()),
        ));
    }

    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_load_class_labels_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.txt");
        fs::write(&path, "nevus\n\n  melanoma \nscar\n").unwrap();

        let labels = load_class_labels(&path).unwrap();

        assert_eq!(labels, vec!["nevus", "melanoma", "scar"]);
    }

    #[test]
    fn test_empty_labels_file_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.txt");
        fs::write(&path, "\n\n").unwrap();

        let err = load_class_labels(&path).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
