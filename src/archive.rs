use std::{
    fs::File,
    io::{self, Read, Seek},
    path::Path,
};
use thiserror::Error;
use zip::ZipArchive;

const MODEL_ENTRY_EXTENSION: &str = ".onnx";

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("failed to open artifact: {0}")]
    Io(#[from] io::Error),
    #[error("artifact is not a valid zip archive: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("archive holds no {} entry", MODEL_ENTRY_EXTENSION)]
    NoModelEntry,
}

/// Name of the model graph inside the archive. When several graphs are
/// present the lexicographically first one wins.
fn model_entry_name<R: Read + Seek>(archive: &ZipArchive<R>) -> Option<String> {
    archive
        .file_names()
        .filter(|name| name.to_lowercase().ends_with(MODEL_ENTRY_EXTENSION))
        .min()
        .map(str::to_string)
}

pub fn verify_archive(path: &Path) -> Result<(), ArchiveError> {
    let archive = ZipArchive::new(File::open(path)?)?;
    model_entry_name(&archive)
        .map(|_| ())
        .ok_or(ArchiveError::NoModelEntry)
}

pub fn read_model_graph(path: &Path) -> Result<Vec<u8>, ArchiveError> {
    let mut archive = ZipArchive::new(File::open(path)?)?;
    let name = model_entry_name(&archive).ok_or(ArchiveError::NoModelEntry)?;

    let mut entry = archive.by_name(&name)?;
    let mut graph = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut graph)?;
    tracing::debug!(entry = %name, bytes = graph.len(), "Read model graph from archive");

    Ok(graph)
}
