/// Hidden directory under each class root holding chunked-upload partial files.
pub const UPLOADS_DIR_NAME: &str = ".uploads";

/// Suffix of partial files inside [`UPLOADS_DIR_NAME`].
pub const PARTIAL_SUFFIX: &str = ".part";

/// Suffix of hidden temp files written next to their final location.
pub const TEMP_SUFFIX: &str = ".tmp";
