//! `write-flash`: write raw images through the ROM bootloader.

use {
    crate::{
        Cli, commands::ensure_not_interrupted, config::Config, open_session,
        use_fancy_output,
    },
    anyhow::{Context, Result},
    console::style,
    dezflash::{
        FlashCoordinator, FlashFrequency, FlashJob, FlashMode, FlashOptions, FlashRequest,
        FlashSize,
    },
    indicatif::{ProgressBar, ProgressStyle},
    log::info,
    std::{path::PathBuf, str::FromStr},
};

/// Parsed `write-flash` arguments.
pub(crate) struct WriteFlashArgs<'a> {
    pub images: &'a [(PathBuf, u32)],
    pub flash_size: Option<FlashSize>,
    pub flash_freq: Option<FlashFrequency>,
    pub flash_mode: Option<FlashMode>,
    pub no_erase_all: bool,
    pub compress: bool,
    pub continue_on_error: bool,
    pub no_reset: bool,
}

/// Resolve job options: flags win, then `[flash]` config, then defaults.
///
/// Bulk erase is on unless `--no-erase-all` or `erase_all = false` says
/// otherwise.
pub(crate) fn flash_options(args: &WriteFlashArgs<'_>, config: &Config) -> Result<FlashOptions> {
    let flash = &config.flash;
    Ok(FlashOptions {
        flash_size: resolve(args.flash_size, flash.flash_size.as_deref())?,
        flash_freq: resolve(args.flash_freq, flash.flash_freq.as_deref())?,
        flash_mode: resolve(args.flash_mode, flash.flash_mode.as_deref())?,
        erase_all: !args.no_erase_all && flash.erase_all != Some(false),
        compress: args.compress || flash.compress == Some(true),
        continue_on_error: args.continue_on_error,
    })
}

fn resolve<T>(flag: Option<T>, configured: Option<&str>) -> dezflash::Result<Option<T>>
where
    T: FromStr<Err = dezflash::Error>,
{
    match flag {
        Some(value) => Ok(Some(value)),
        None => configured
            .map(str::parse)
            .transpose(),
    }
}

/// Read every image and assemble the job.
pub(crate) fn build_job(args: &WriteFlashArgs<'_>, options: FlashOptions) -> Result<FlashJob> {
    let mut job = FlashJob::new(Vec::new()).with_options(options);
    for (path, address) in args.images {
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read image {}", path.display()))?;
        job.push(FlashRequest::new(data, *address));
    }
    Ok(job)
}

/// `write-flash` command implementation.
pub(crate) fn cmd_write_flash(
    cli: &Cli,
    config: &mut Config,
    args: &WriteFlashArgs<'_>,
) -> Result<()> {
    let options = flash_options(args, config)?;
    let job = build_job(args, options)?;
    // Reject bad layouts before touching the port
    job.validate()?;

    if !cli.quiet {
        for (request, (path, _)) in job
            .requests()
            .iter()
            .zip(args.images)
        {
            eprintln!(
                "    {} {} @ 0x{:08X} ({} bytes)",
                style("•").dim(),
                path.display(),
                request.address,
                request
                    .data
                    .len()
            );
        }
    }

    let session = open_session(cli, config)?;
    ensure_not_interrupted()?;
    let mut coordinator = FlashCoordinator::new(session);

    let pb = if cli.quiet || !use_fancy_output() {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(100);
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb
    };

    let quiet = cli.quiet;
    let mut current = None;
    let result = coordinator.run(
        &job,
        |line| {
            if !quiet {
                pb.suspend(|| info!("{line}"));
            }
        },
        |index, percent| {
            if current != Some(index) {
                current = Some(index);
                pb.reset();
                pb.set_message(format!(
                    "image {}/{}",
                    index + 1,
                    job.requests()
                        .len()
                ));
            }
            pb.set_position(u64::from(percent));
        },
    );

    let report = match result {
        Ok(report) => report,
        Err(err) => {
            pb.abandon();
            coordinator
                .session_mut()
                .disconnect();
            return Err(err.into());
        },
    };
    pb.finish_with_message("done");

    let session = coordinator.session_mut();
    if args.no_reset {
        session.disconnect();
    } else {
        if !cli.quiet {
            eprintln!("{} Resetting the chip...", style("🔄").cyan());
        }
        session.hard_reset()?;
    }

    if !cli.quiet {
        eprintln!(
            "\n{} Wrote {} bytes in {} images",
            style("🎉")
                .green()
                .bold(),
            job.total_bytes(),
            report
                .completed
                .len()
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use {super::*, std::fs, tempfile::tempdir};

    fn args(images: &[(PathBuf, u32)]) -> WriteFlashArgs<'_> {
        WriteFlashArgs {
            images,
            flash_size: None,
            flash_freq: None,
            flash_mode: None,
            no_erase_all: false,
            compress: false,
            continue_on_error: false,
            no_reset: false,
        }
    }

    #[test]
    fn test_flash_options_defaults_to_bulk_erase() {
        let options = flash_options(&args(&[]), &Config::default()).unwrap();
        assert!(options.erase_all);
        assert!(!options.compress);
        assert!(options.flash_size.is_none());
    }

    #[test]
    fn test_flash_options_no_erase_all_flag_and_config() {
        let mut a = args(&[]);
        a.no_erase_all = true;
        assert!(!flash_options(&a, &Config::default()).unwrap().erase_all);

        let mut config = Config::default();
        config.flash.erase_all = Some(false);
        assert!(!flash_options(&args(&[]), &config).unwrap().erase_all);
    }

    #[test]
    fn test_flash_options_flags_override_config() {
        let mut config = Config::default();
        config.flash.flash_size = Some("2MB".to_string());
        config.flash.flash_mode = Some("qio".to_string());
        config.flash.compress = Some(true);

        let mut a = args(&[]);
        a.flash_size = Some(FlashSize::_8Mb);
        let options = flash_options(&a, &config).unwrap();
        assert_eq!(options.flash_size, Some(FlashSize::_8Mb));
        assert_eq!(options.flash_mode, Some(FlashMode::Qio));
        assert!(options.compress);
    }

    #[test]
    fn test_flash_options_invalid_config_value_is_config_error() {
        let mut config = Config::default();
        config.flash.flash_freq = Some("90m".to_string());
        let err = flash_options(&args(&[]), &config).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<dezflash::Error>(),
            Some(dezflash::Error::Config(_))
        ));
    }

    #[test]
    fn test_build_job_reads_images_in_order() {
        let dir = tempdir().unwrap();
        let app = dir.path().join("app.bin");
        let data = dir.path().join("data.bin");
        fs::write(&app, [0xAA; 16]).unwrap();
        fs::write(&data, [0x55; 8]).unwrap();

        let images = vec![(app, 0x10000), (data, 0x110000)];
        let job = build_job(&args(&images), FlashOptions::default()).unwrap();
        assert_eq!(job.requests().len(), 2);
        assert_eq!(job.requests()[0].address, 0x10000);
        assert_eq!(job.requests()[1].data, vec![0x55; 8]);
        assert_eq!(job.total_bytes(), 24);
    }

    #[test]
    fn test_build_job_missing_file_names_path() {
        let dir = tempdir().unwrap();
        let images = vec![(dir.path().join("missing.bin"), 0x1000)];
        let err = build_job(&args(&images), FlashOptions::default()).unwrap_err();
        assert!(format!("{err:#}").contains("missing.bin"));
    }
}
