use thiserror::Error;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("number {0} cannot be canonicalized losslessly; render it as a decimal string")]
    NonCanonicalNumber(serde_json::Number),
}

#[derive(Debug, Error)]
pub enum ParamsError {
    #[error("unknown asset slug: {0}")]
    UnknownSlug(String),

    #[error("invalid params for slug {slug}: {message}")]
    InvalidParams { slug: String, message: String },

    #[error("user id out of range or not a safe integer: {0}")]
    InvalidUserId(String),
}
