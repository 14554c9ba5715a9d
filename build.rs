use anyhow::Result;
use vergen::EmitBuilder;

/// Embeds build and git metadata (commit SHA, build timestamp, cargo target
/// triple) as `CARGO_*`/`VERGEN_*` environment variables at compile time, for
/// the long `--version` string (see `cli::long_version`).
fn main() -> Result<()> {
    EmitBuilder::builder().build_timestamp().cargo_target_triple().git_sha(true).emit()?;
    Ok(())
}
