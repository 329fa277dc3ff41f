//! Shell completion generation and installation.

use {
    crate::Cli,
    anyhow::{Context, Result},
    clap::CommandFactory,
    clap_complete::{Shell, generate},
    console::style,
    std::{
        env, fs,
        io::{self, Write as _},
        path::{Path, PathBuf},
    },
};

const BIN: &str = "dezflash";

/// Generate shell completions to stdout.
pub(crate) fn cmd_completions(shell: Shell) {
    io::stdout()
        .write_all(&completion_script(shell))
        .ok();
}

fn completion_script(shell: Shell) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, BIN, &mut buf);
    buf
}

/// Detect the user's current shell from environment.
fn detect_shell_type() -> Option<Shell> {
    if let Ok(shell_path) = env::var("SHELL") {
        return shell_from_path(&shell_path);
    }
    if cfg!(windows) && env::var("PSModulePath").is_ok() {
        return Some(Shell::PowerShell);
    }
    None
}

/// Map a shell binary path to its `Shell`.
fn shell_from_path(shell_path: &str) -> Option<Shell> {
    match Path::new(shell_path)
        .file_name()
        .and_then(|n| n.to_str())?
    {
        "bash" => Some(Shell::Bash),
        "zsh" => Some(Shell::Zsh),
        "fish" => Some(Shell::Fish),
        "elvish" => Some(Shell::Elvish),
        "pwsh" | "powershell" => Some(Shell::PowerShell),
        _ => None,
    }
}

/// Directories completion files are installed under.
struct InstallDirs {
    home: PathBuf,
    config: PathBuf,
    data: PathBuf,
    powershell_profile: Option<PathBuf>,
}

impl InstallDirs {
    fn from_env() -> Result<Self> {
        let home = env::var("HOME")
            .or_else(|_| env::var("USERPROFILE"))
            .map(PathBuf::from)
            .context("Could not determine home directory")?;
        let config = env::var("XDG_CONFIG_HOME")
            .map_or_else(|_| home.join(".config"), PathBuf::from);
        let data = env::var("XDG_DATA_HOME").map_or_else(
            |_| {
                home.join(".local")
                    .join("share")
            },
            PathBuf::from,
        );
        Ok(Self {
            home,
            config,
            data,
            powershell_profile: env::var("PROFILE")
                .ok()
                .map(PathBuf::from),
        })
    }

    /// Completion file location for `shell`.
    fn completion_path(&self, shell: Shell) -> Result<PathBuf> {
        let path = match shell {
            Shell::Bash => self
                .data
                .join("bash-completion/completions")
                .join(BIN),
            Shell::Zsh => self
                .home
                .join(".zfunc")
                .join(format!("_{BIN}")),
            Shell::Fish => self
                .config
                .join("fish/completions")
                .join(format!("{BIN}.fish")),
            Shell::Elvish => self
                .config
                .join("elvish/lib")
                .join(format!("{BIN}.elv")),
            Shell::PowerShell => self
                .powershell_profile
                .as_deref()
                .and_then(Path::parent)
                .map_or_else(
                    || {
                        self.config
                            .join("powershell/completions")
                    },
                    Path::to_path_buf,
                )
                .join(format!("{BIN}.ps1")),
            _ => anyhow::bail!("Unsupported shell for auto-install"),
        };
        Ok(path)
    }
}

/// Make sure `~/.zshrc` puts `~/.zfunc` on the completion path.
fn ensure_zsh_fpath(home: &Path) -> Result<()> {
    let zshrc = home.join(".zshrc");
    let fpath_line = "fpath=(~/.zfunc $fpath)";
    if fs::read_to_string(&zshrc).is_ok_and(|content| content.contains(fpath_line)) {
        return Ok(());
    }

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&zshrc)
        .with_context(|| format!("Failed to update {}", zshrc.display()))?;
    writeln!(file, "\n# {BIN} completions\n{fpath_line}\nautoload -Uz compinit && compinit")?;
    eprintln!(
        "{} Added fpath to {}",
        style("✓")
            .green()
            .bold(),
        style(zshrc.display()).yellow()
    );
    Ok(())
}

/// Install shell completions automatically.
pub(crate) fn cmd_completions_install(shell_arg: Option<Shell>) -> Result<()> {
    let shell = match shell_arg {
        Some(s) => s,
        None => detect_shell_type().context(
            "Could not detect your shell. Please specify it explicitly:\n  \
             dezflash completions --install bash",
        )?,
    };

    let dirs = InstallDirs::from_env()?;
    let path = dirs.completion_path(shell)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(&path, completion_script(shell))
        .with_context(|| format!("Failed to write completion file: {}", path.display()))?;

    eprintln!(
        "{} Installed {} completions to {}",
        style("✓")
            .green()
            .bold(),
        style(shell).cyan(),
        style(path.display()).yellow()
    );
    eprintln!();

    match shell {
        Shell::Bash => eprintln!(
            "Completions load on new terminals. To activate now: {}",
            style(format!("source {}", path.display())).cyan()
        ),
        Shell::Zsh => {
            ensure_zsh_fpath(&dirs.home)?;
            eprintln!("Restart your shell or run: {}", style("exec zsh").cyan());
        },
        Shell::PowerShell => eprintln!(
            "Add this to your PowerShell profile: {}",
            style(format!("Import-Module {}", path.display())).cyan()
        ),
        _ => eprintln!("Completions load automatically in new {shell} sessions."),
    }

    Ok(())
}
