//! Upload attachments.

use reqwest::multipart::Part;

/// A file to upload with a request.
///
/// Contents are owned bytes: retry attempts rebuild the multipart part from
/// the start of the data, so a failed attempt never consumes the upload.
#[derive(Debug, Clone)]
pub struct File {
    filename: String,
    contents: Vec<u8>,
}

impl File {
    pub fn new(filename: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            contents: contents.into(),
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// The multipart field name Discord expects for this attachment.
    pub(crate) fn field_name(&self) -> String {
        format!("file_{}", self.filename)
    }

    pub(crate) fn to_part(&self) -> Part {
        Part::bytes(self.contents.clone()).file_name(self.filename.clone())
    }
}
