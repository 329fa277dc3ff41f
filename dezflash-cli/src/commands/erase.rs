//! `erase-flash`: bulk erase of the whole flash chip.

use {
    crate::{Cli, commands::ensure_not_interrupted, config::Config, connect_session, open_session},
    anyhow::Result,
    console::style,
};

/// `erase-flash` command implementation.
pub(crate) fn cmd_erase_flash(cli: &Cli, config: &mut Config) -> Result<()> {
    let mut session = open_session(cli, config)?;
    ensure_not_interrupted()?;
    connect_session(cli, &mut session)?;

    if !cli.quiet {
        eprintln!(
            "{} Erasing flash (this may take a while)...",
            style("🗑").red()
        );
    }
    session.erase_flash()?;
    ensure_not_interrupted()?;
    session.hard_reset()?;

    if !cli.quiet {
        eprintln!(
            "\n{} Flash erased",
            style("✓")
                .green()
                .bold()
        );
    }

    Ok(())
}
