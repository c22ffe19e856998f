//! Stable exit codes for the mender CLI.

/// Run finished with a green gate (or a valid no-op outcome).
pub const OK: i32 = 0;
/// Invalid configuration, sandbox violation, or another unrecoverable error.
pub const INVALID: i32 = 1;
/// All passes were spent without a green gate.
pub const EXHAUSTED: i32 = 2;
/// Another run holds the lock for this checkout.
pub const LOCKED: i32 = 3;
