/// Directory name used under the temp root and platform directories.
pub const APP_NAME: &str = "lockwrap";

/// Length of the truncated hash used for input fingerprints.
pub const OBJ_HASH_PREFIX_LEN: usize = 20;

/// Extension appended to the payload filename for the generated source.
pub const SOURCE_EXT: &str = "cs";

/// Suffix appended to the payload filename for the raw compiler output.
pub const BUILD_OUTPUT_SUFFIX: &str = "out.exe";

/// Extension appended to the payload filename for an extracted icon.
pub const ICON_EXT: &str = "ico";

/// Default program entry point passed to the compiler.
pub const DEFAULT_ENTRY_POINT: &str = "LockwrapTemplate.Template";

/// Default upper bound on a single compiler run, in seconds.
pub const DEFAULT_COMPILE_TIMEOUT_SECS: u64 = 300;
