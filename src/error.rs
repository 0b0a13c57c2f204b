use serde::Serialize;

/// Machine readable error codes returned in HTTP error bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    MissingFragment,
    SizeMismatch,
    #[serde(rename = "IOFailure")]
    IoFailure,
    ModelLoadFailure,
    UnsupportedImage,
    InferenceFailure,
    InvalidRequest,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::MissingFragment => "MissingFragment",
            ErrorCode::SizeMismatch => "SizeMismatch",
            ErrorCode::IoFailure => "IOFailure",
            ErrorCode::ModelLoadFailure => "ModelLoadFailure",
            ErrorCode::UnsupportedImage => "UnsupportedImage",
            ErrorCode::InferenceFailure => "InferenceFailure",
            ErrorCode::InvalidRequest => "InvalidRequest",
        }
    }
}
