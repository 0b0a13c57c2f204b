use crate::{
    archive::{verify_archive, ArchiveError},
    config::ArtifactConfig,
    error::ErrorCode,
};
use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AssemblyError {
    #[error("no fragments named {prefix}* found in {dir:?}")]
    NoFragments { dir: PathBuf, prefix: String },
    #[error("fragment {expected} is missing")]
    MissingFragment { expected: String },
    #[error("fragment suffixes do not form a sequence: {0}")]
    UnorderedSuffixes(String),
    #[error("fragment {name} falls outside the {expected} expected fragments")]
    UnexpectedFragment { name: String, expected: usize },
    #[error("assembled {actual} bytes but fragments hold {expected} bytes")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("I/O failure on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("assembled artifact failed verification: {0}")]
    MalformedArtifact(#[from] ArchiveError),
}

impl AssemblyError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AssemblyError::NoFragments { .. }
            | AssemblyError::MissingFragment { .. }
            | AssemblyError::UnorderedSuffixes(_) => ErrorCode::MissingFragment,
            AssemblyError::UnexpectedFragment { .. } | AssemblyError::SizeMismatch { .. } => {
                ErrorCode::SizeMismatch
            }
            AssemblyError::Io { .. } => ErrorCode::IoFailure,
            AssemblyError::MalformedArtifact(_) => ErrorCode::ModelLoadFailure,
        }
    }
}

fn io_failure(path: &Path) -> impl FnOnce(io::Error) -> AssemblyError + '_ {
    move |source| AssemblyError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SuffixKind {
    Numeric,
    Alphabetic,
}

impl SuffixKind {
    fn of(suffix: &str) -> Option<Self> {
        if suffix.is_empty() {
            None
        } else if suffix.bytes().all(|b| b.is_ascii_digit()) {
            Some(Self::Numeric)
        } else if suffix.bytes().all(|b| b.is_ascii_lowercase()) {
            Some(Self::Alphabetic)
        } else {
            None
        }
    }

    fn index(&self, suffix: &str) -> Option<u64> {
        match self {
            Self::Numeric => suffix.parse().ok(),
            Self::Alphabetic => suffix.bytes().try_fold(0u64, |acc, b| {
                acc.checked_mul(26)?.checked_add(u64::from(b - b'a'))
            }),
        }
    }

    fn render(&self, index: u64, width: usize) -> String {
        match self {
            Self::Numeric => format!("{:0width$}", index, width = width),
            Self::Alphabetic => {
                let mut letters = vec![b'a'; width];
                let mut rest = index;
                for slot in letters.iter_mut().rev() {
                    *slot = b'a' + (rest % 26) as u8;
                    rest /= 26;
                }
                String::from_utf8_lossy(&letters).into_owned()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Fragment {
    pub path: PathBuf,
    pub suffix: String,
    pub len: u64,
}

#[derive(Debug, Clone)]
pub struct AssembledArtifact {
    pub path: PathBuf,
    pub fragment_count: usize,
    pub total_bytes: u64,
    pub reused: bool,
}

/// Rebuilds the model archive from `<base_name><marker><suffix>` fragments.
#[derive(Debug, Clone)]
pub struct ChunkAssembler {
    fragments_dir: PathBuf,
    prefix: String,
    output_path: PathBuf,
    expected_fragments: usize,
    numeric_start: u64,
}

impl ChunkAssembler {
    pub fn new(config: &ArtifactConfig) -> Self {
        Self {
            fragments_dir: config.fragments_dir.clone(),
            prefix: format!("{}{}", config.base_name, config.fragment_marker),
            output_path: config.output_path.clone(),
            expected_fragments: config.expected_fragments,
            numeric_start: config.numeric_start,
        }
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Lists the fragments in suffix order and checks the sequence has no gaps.
    pub fn list_fragments(&self) -> Result<Vec<Fragment>, AssemblyError> {
        let mut fragments = Vec::new();
        let entries = fs::read_dir(&self.fragments_dir).map_err(io_failure(&self.fragments_dir))?;

        for entry in entries {
            let entry = entry.map_err(io_failure(&self.fragments_dir))?;
            let file_name = entry.file_name();
            let Some(suffix) = file_name
                .to_str()
                .and_then(|name| name.strip_prefix(&self.prefix))
            else {
                continue;
            };
            if suffix.is_empty() {
                continue;
            }
            let path = entry.path();
            let metadata = entry.metadata().map_err(io_failure(&path))?;
            if !metadata.is_file() {
                continue;
            }
            fragments.push(Fragment {
                path,
                suffix: suffix.to_string(),
                len: metadata.len(),
            });
        }

        if fragments.is_empty() {
            return Err(AssemblyError::NoFragments {
                dir: self.fragments_dir.clone(),
                prefix: self.prefix.clone(),
            });
        }

        fragments.sort_by(|a, b| a.suffix.cmp(&b.suffix));
        self.check_sequence(&fragments)?;

        Ok(fragments)
    }

    fn check_sequence(&self, fragments: &[Fragment]) -> Result<(), AssemblyError> {
        let first = &fragments[0].suffix;
        let width = first.len();
        let kind = SuffixKind::of(first)
            .ok_or_else(|| AssemblyError::UnorderedSuffixes(format!("unrecognised suffix {:?}", first)))?;

        let mut indices = Vec::with_capacity(fragments.len());
        for fragment in fragments {
            let index = (SuffixKind::of(&fragment.suffix) == Some(kind)
                && fragment.suffix.len() == width)
                .then(|| kind.index(&fragment.suffix))
                .flatten()
                .ok_or_else(|| {
                    AssemblyError::UnorderedSuffixes(format!(
                        "{:?} does not match the width and kind of {:?}",
                        fragment.suffix, first
                    ))
                })?;
            indices.push(index);
        }

        let start = match kind {
            SuffixKind::Numeric => self.numeric_start,
            SuffixKind::Alphabetic => 0,
        };
        let end = start + self.expected_fragments as u64;
        if let Some(position) = indices.iter().position(|i| !(start..end).contains(i)) {
            return Err(AssemblyError::UnexpectedFragment {
                name: format!("{}{}", self.prefix, fragments[position].suffix),
                expected: self.expected_fragments,
            });
        }

        // Suffixes are sorted and unique, so the first hole is the first
        // index that differs from its position.
        let missing = (start..end)
            .zip(indices.iter().copied().map(Some).chain(std::iter::repeat(None)))
            .find(|(expected, found)| *found != Some(*expected))
            .map(|(expected, _)| expected);
        if let Some(index) = missing {
            return Err(AssemblyError::MissingFragment {
                expected: format!("{}{}", self.prefix, kind.render(index, width)),
            });
        }

        Ok(())
    }

    /// Concatenates the fragments into the output path, or reuses an existing
    /// artifact of the expected size that still verifies.
    pub fn assemble(&self) -> Result<AssembledArtifact, AssemblyError> {
        let fragments = self.list_fragments()?;
        let total_bytes: u64 = fragments.iter().map(|f| f.len).sum();

        if let Ok(metadata) = fs::metadata(&self.output_path) {
            if metadata.len() == total_bytes {
                match verify_archive(&self.output_path) {
                    Ok(()) => {
                        tracing::info!(
                            path = %self.output_path.display(),
                            bytes = total_bytes,
                            "Reusing previously assembled artifact"
                        );
                        return Ok(AssembledArtifact {
                            path: self.output_path.clone(),
                            fragment_count: fragments.len(),
                            total_bytes,
                            reused: true,
                        });
                    }
                    Err(e) => {
                        tracing::warn!("Existing artifact failed verification, rebuilding: {}", e)
                    }
                }
            }
        }

        self.concatenate(&fragments, total_bytes)?;

        tracing::info!(
            path = %self.output_path.display(),
            fragments = fragments.len(),
            bytes = total_bytes,
            "Assembled model artifact"
        );

        Ok(AssembledArtifact {
            path: self.output_path.clone(),
            fragment_count: fragments.len(),
            total_bytes,
            reused: false,
        })
    }

    fn concatenate(&self, fragments: &[Fragment], expected: u64) -> Result<(), AssemblyError> {
        let parent = match self.output_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).map_err(io_failure(parent))?;

        // The staging file is removed on drop unless persisted.
        let mut staging = tempfile::Builder::new()
            .prefix(".assembling-")
            .tempfile_in(parent)
            .map_err(io_failure(parent))?;
        let staging_path = staging.path().to_path_buf();

        let mut written = 0u64;
        {
            let mut writer = BufWriter::new(staging.as_file_mut());
            for fragment in fragments {
                tracing::debug!(
                    fragment = %fragment.path.display(),
                    bytes = fragment.len,
                    "Appending fragment"
                );
                let mut reader = File::open(&fragment.path).map_err(io_failure(&fragment.path))?;
                let copied =
                    io::copy(&mut reader, &mut writer).map_err(io_failure(&fragment.path))?;
                if copied != fragment.len {
                    return Err(AssemblyError::SizeMismatch {
                        expected: fragment.len,
                        actual: copied,
                    });
                }
                written += copied;
            }
            writer.flush().map_err(io_failure(&staging_path))?;
        }
        staging
            .as_file()
            .sync_all()
            .map_err(io_failure(&staging_path))?;

        if written != expected {
            return Err(AssemblyError::SizeMismatch {
                expected,
                actual: written,
            });
        }

        verify_archive(&staging_path)?;

        staging
            .persist(&self.output_path)
            .map_err(|e| AssemblyError::Io {
                path: self.output_path.clone(),
                source: e.error,
            })?;

        let actual = fs::metadata(&self.output_path)
            .map_err(io_failure(&self.output_path))?
            .len();
        if actual != expected {
            return Err(AssemblyError::SizeMismatch { expected, actual });
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        archive::tests::model_archive,
        config::{load_configuration, Environment},
    };

    const BASE_NAME: &str = "skin_lesion.onnx.zip";

    pub(crate) fn artifact_config(dir: &Path, expected_fragments: usize) -> ArtifactConfig {
        ArtifactConfig {
            fragments_dir: dir.join("fragments"),
            base_name: BASE_NAME.to_string(),
            fragment_marker: ".part".to_string(),
            output_path: dir.join("assembled").join(BASE_NAME),
            expected_fragments,
            numeric_start: 0,
        }
    }

    /// Splits `bytes` into `parts` pieces named with `suffixes`, written in
    /// reverse order so directory listing order differs from suffix order.
    pub(crate) fn write_fragments(dir: &Path, bytes: &[u8], suffixes: &[&str]) {
        fs::create_dir_all(dir).unwrap();
        let chunk = bytes.len().div_ceil(suffixes.len());
        let pieces: Vec<&[u8]> = bytes.chunks(chunk).collect();
        assert_eq!(pieces.len(), suffixes.len());
        for (piece, suffix) in pieces.iter().zip(suffixes).rev() {
            fs::write(dir.join(format!("{}.part{}", BASE_NAME, suffix)), piece).unwrap();
        }
    }

    fn sample_archive() -> Vec<u8> {
        let graph: Vec<u8> = (0..4096u32).map(|i| (i * 31 % 251) as u8).collect();
        model_archive(&[("bcn20000.onnx", graph.as_slice())])
    }

    fn fragment(config: &ArtifactConfig, suffix: &str) -> PathBuf {
        config
            .fragments_dir
            .join(format!("{}{}{}", config.base_name, config.fragment_marker, suffix))
    }

    /// Shipped artifact settings with the directories moved under `dir`.
    fn shipped_config(dir: &Path) -> ArtifactConfig {
        let configuration = Path::new(env!("CARGO_MANIFEST_DIR")).join("configuration");
        let shipped = load_configuration(&configuration, Environment::Local)
            .unwrap()
            .artifact;
        ArtifactConfig {
            fragments_dir: dir.join("fragments"),
            output_path: dir.join("assembled").join(&shipped.base_name),
            ..shipped
        }
    }

    fn shipped_suffixes(config: &ArtifactConfig) -> Vec<String> {
        (0..config.expected_fragments as u64)
            .map(|i| SuffixKind::Alphabetic.render(i, 2))
            .collect()
    }

    fn write_shipped_fragments(config: &ArtifactConfig) -> Vec<String> {
        let suffixes = shipped_suffixes(config);
        let refs: Vec<&str> = suffixes.iter().map(String::as_str).collect();
        fs::create_dir_all(&config.fragments_dir).unwrap();
        let bytes = sample_archive();
        let chunk = bytes.len().div_ceil(refs.len());
        for (piece, suffix) in bytes.chunks(chunk).zip(&refs) {
            fs::write(fragment(config, suffix), piece).unwrap();
        }
        suffixes
    }

    fn leftover_outputs(config: &ArtifactConfig) -> usize {
        match fs::read_dir(config.output_path.parent().unwrap()) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }

    #[test]
    fn test_assemble_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let config = artifact_config(dir.path(), 3);
        let original = sample_archive();
        write_fragments(&config.fragments_dir, &original, &["aa", "ab", "ac"]);

        let assembled = ChunkAssembler::new(&config).assemble().unwrap();

        assert!(!assembled.reused);
        assert_eq!(assembled.fragment_count, 3);
        assert_eq!(assembled.total_bytes, original.len() as u64);
        assert_eq!(fs::read(&config.output_path).unwrap(), original);
    }

    #[test]
    fn test_numeric_suffixes_from_configured_start() {
        let dir = tempfile::tempdir().unwrap();
        let config = ArtifactConfig {
            numeric_start: 1,
            ..artifact_config(dir.path(), 4)
        };
        let original = sample_archive();
        write_fragments(&config.fragments_dir, &original, &["01", "02", "03", "04"]);

        ChunkAssembler::new(&config).assemble().unwrap();

        assert_eq!(fs::read(&config.output_path).unwrap(), original);
    }

    #[test]
    fn test_missing_zero_numeric_fragment() {
        let dir = tempfile::tempdir().unwrap();
        let config = artifact_config(dir.path(), 3);
        write_fragments(&config.fragments_dir, &sample_archive(), &["00", "01", "02"]);
        fs::remove_file(fragment(&config, "00")).unwrap();

        let err = ChunkAssembler::new(&config).assemble().unwrap_err();

        assert_eq!(err.code(), ErrorCode::MissingFragment);
        assert!(matches!(err, AssemblyError::MissingFragment { ref expected } if expected.ends_with(".part00")));
    }

    #[test]
    fn test_missing_middle_fragment() {
        let dir = tempfile::tempdir().unwrap();
        let config = artifact_config(dir.path(), 3);
        write_fragments(&config.fragments_dir, &sample_archive(), &["aa", "ab", "ac"]);
        fs::remove_file(fragment(&config, "ab")).unwrap();

        let err = ChunkAssembler::new(&config).assemble().unwrap_err();

        assert_eq!(err.code(), ErrorCode::MissingFragment);
        assert!(err.to_string().contains("skin_lesion.onnx.zip.partab"));
        assert!(!config.output_path.exists());
    }

    #[test]
    fn test_shipped_config_reports_missing_first_fragment() {
        let dir = tempfile::tempdir().unwrap();
        let config = shipped_config(dir.path());
        let suffixes = write_shipped_fragments(&config);
        fs::remove_file(fragment(&config, &suffixes[0])).unwrap();

        let err = ChunkAssembler::new(&config).assemble().unwrap_err();

        assert_eq!(err.code(), ErrorCode::MissingFragment);
        assert!(matches!(err, AssemblyError::MissingFragment { ref expected } if expected.ends_with(&format!(".part{}", suffixes[0]))));
        assert_eq!(leftover_outputs(&config), 0);
    }

    #[test]
    fn test_shipped_config_reports_missing_last_fragment() {
        let dir = tempfile::tempdir().unwrap();
        let config = shipped_config(dir.path());
        let suffixes = write_shipped_fragments(&config);
        let last = suffixes.last().unwrap();
        fs::remove_file(fragment(&config, last)).unwrap();

        let err = ChunkAssembler::new(&config).assemble().unwrap_err();

        assert_eq!(err.code(), ErrorCode::MissingFragment);
        assert!(matches!(err, AssemblyError::MissingFragment { ref expected } if expected.ends_with(&format!(".part{}", last))));
        assert_eq!(leftover_outputs(&config), 0);
    }

    #[test]
    fn test_extra_fragment_is_a_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let config = artifact_config(dir.path(), 3);
        write_fragments(&config.fragments_dir, &sample_archive(), &["aa", "ab", "ac", "ad"]);

        let err = ChunkAssembler::new(&config).assemble().unwrap_err();

        assert!(matches!(err, AssemblyError::UnexpectedFragment { ref name, .. } if name.ends_with(".partad")));
        assert_eq!(err.code(), ErrorCode::SizeMismatch);
        assert!(!config.output_path.exists());
    }

    #[test]
    fn test_fragment_removed_mid_assembly_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let config = artifact_config(dir.path(), 3);
        write_fragments(&config.fragments_dir, &sample_archive(), &["aa", "ab", "ac"]);
        let assembler = ChunkAssembler::new(&config);
        let fragments = assembler.list_fragments().unwrap();
        let total: u64 = fragments.iter().map(|f| f.len).sum();
        fs::remove_file(fragment(&config, "ac")).unwrap();

        let err = assembler.concatenate(&fragments, total).unwrap_err();

        assert!(matches!(err, AssemblyError::Io { ref path, .. } if path.ends_with("skin_lesion.onnx.zip.partac")));
        assert_eq!(err.code(), ErrorCode::IoFailure);
        assert!(!config.output_path.exists());
        assert_eq!(leftover_outputs(&config), 0);
    }

    #[test]
    fn test_fragment_changed_mid_assembly_is_a_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let config = artifact_config(dir.path(), 3);
        write_fragments(&config.fragments_dir, &sample_archive(), &["aa", "ab", "ac"]);
        let assembler = ChunkAssembler::new(&config);
        let fragments = assembler.list_fragments().unwrap();
        let total: u64 = fragments.iter().map(|f| f.len).sum();
        fs::write(fragment(&config, "ab"), b"truncated").unwrap();

        let err = assembler.concatenate(&fragments, total).unwrap_err();

        assert!(matches!(err, AssemblyError::SizeMismatch { actual: 9, .. }));
        assert_eq!(err.code(), ErrorCode::SizeMismatch);
        assert!(!config.output_path.exists());
        assert_eq!(leftover_outputs(&config), 0);
    }

    #[test]
    fn test_corrupt_fragment_fails_archive_check() {
        let dir = tempfile::tempdir().unwrap();
        let config = artifact_config(dir.path(), 3);
        let original = sample_archive();
        write_fragments(&config.fragments_dir, &original, &["aa", "ab", "ac"]);
        let last = fragment(&config, "ac");
        let len = fs::metadata(&last).unwrap().len() as usize;
        fs::write(&last, vec![0u8; len]).unwrap();

        let err = ChunkAssembler::new(&config).assemble().unwrap_err();

        assert!(matches!(err, AssemblyError::MalformedArtifact(_)));
        assert_eq!(err.code(), ErrorCode::ModelLoadFailure);
        assert!(!config.output_path.exists());
        assert_eq!(leftover_outputs(&config), 0);
    }

    #[test]
    fn test_mixed_suffix_widths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = artifact_config(dir.path(), 3);
        write_fragments(&config.fragments_dir, &sample_archive(), &["1", "2", "10"]);

        let err = ChunkAssembler::new(&config).assemble().unwrap_err();

        assert!(matches!(err, AssemblyError::UnorderedSuffixes(_)));
    }

    #[test]
    fn test_no_fragments() {
        let dir = tempfile::tempdir().unwrap();
        let config = artifact_config(dir.path(), 3);
        fs::create_dir_all(&config.fragments_dir).unwrap();
        fs::write(config.fragments_dir.join("unrelated.bin"), b"x").unwrap();

        let err = ChunkAssembler::new(&config).assemble().unwrap_err();

        assert!(matches!(err, AssemblyError::NoFragments { .. }));
        assert_eq!(err.code(), ErrorCode::MissingFragment);
    }

    #[test]
    fn test_existing_artifact_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let config = artifact_config(dir.path(), 2);
        write_fragments(&config.fragments_dir, &sample_archive(), &["aa", "ab"]);
        let assembler = ChunkAssembler::new(&config);

        assert!(!assembler.assemble().unwrap().reused);
        assert!(assembler.assemble().unwrap().reused);

        fs::remove_file(&config.output_path).unwrap();
        assert!(!assembler.assemble().unwrap().reused);
    }

    #[test]
    fn test_stale_artifact_is_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let config = artifact_config(dir.path(), 2);
        let original = sample_archive();
        write_fragments(&config.fragments_dir, &original, &["aa", "ab"]);
        fs::create_dir_all(config.output_path.parent().unwrap()).unwrap();
        fs::write(&config.output_path, vec![0u8; original.len()]).unwrap();

        let assembled = ChunkAssembler::new(&config).assemble().unwrap();

        assert!(!assembled.reused);
        assert_eq!(fs::read(&config.output_path).unwrap(), original);
    }

    #[test]
    fn test_alphabetic_suffix_rendering() {
        assert_eq!(SuffixKind::Alphabetic.render(0, 2), "aa");
        assert_eq!(SuffixKind::Alphabetic.render(27, 2), "bb");
        assert_eq!(SuffixKind::Alphabetic.index("bb"), Some(27));
        assert_eq!(SuffixKind::Numeric.render(7, 3), "007");
    }
}
