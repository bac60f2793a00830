//! Stable exit codes for `ralph` commands.

/// Command succeeded; for `ralph run`, verification passed and the work is complete.
pub const OK: i32 = 0;
/// Invalid input, config or run state, or another driver-side error.
pub const INVALID: i32 = 1;
/// `ralph run` reached its iteration cap without success.
pub const EXHAUSTED: i32 = 2;
/// `ralph run` stopped between iterations after Ctrl-C; resumable with `--resume`.
pub const INTERRUPTED: i32 = 130;
