/// Identity of the SDK, sent to the server in headers and metrics attributes.
///
/// Constructed once and passed to every collaborator instead of living in process-wide statics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdkMetadata {
    /// SDK name, as reported in the `Harness-SDK-Info` header.
    pub name: &'static str,
    /// Version of the SDK.
    pub version: &'static str,
    /// Implementation language, reported in `User-Agent` and in metrics.
    pub language: &'static str,
}

impl SdkMetadata {
    /// Metadata of this crate.
    pub const fn current() -> SdkMetadata {
        SdkMetadata {
            name: "Rust",
            version: env!("CARGO_PKG_VERSION"),
            language: "Rust",
        }
    }

    /// Value for the `Harness-SDK-Info` header.
    pub fn sdk_info_header(&self) -> String {
        format!("{} {} Client", self.name, self.version)
    }

    /// Value for the `User-Agent` header.
    pub fn user_agent(&self) -> String {
        format!("{}/{}", self.language, self.version)
    }
}

impl Default for SdkMetadata {
    fn default() -> SdkMetadata {
        SdkMetadata::current()
    }
}
