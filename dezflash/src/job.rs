//! Flash jobs and the coordinator that runs them.
//!
//! A [`FlashJob`] is an ordered list of `(data, address)` pairs plus the
//! options shared by all of them. The [`FlashCoordinator`] validates a job,
//! runs it on its [`Session`], and turns the session's byte-level progress
//! into per-request percentages and log lines for a front end.

use {
    crate::{
        error::{Error, Result},
        port::PortOpener,
        session::{FlashReport, Session, SessionState},
        target::{FlashFrequency, FlashMode, FlashSettings, FlashSize},
    },
    log::debug,
};

/// One image and the flash address it is written to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashRequest {
    /// Image bytes.
    pub data: Vec<u8>,
    /// Target flash address.
    pub address: u32,
}

impl FlashRequest {
    /// Create a request.
    pub fn new(data: Vec<u8>, address: u32) -> Self {
        Self { data, address }
    }

    /// Exclusive end of the target range.
    pub fn end(&self) -> u64 {
        u64::from(self.address)
            + self
                .data
                .len() as u64
    }
}

/// Options shared by every request of a job.
///
/// The defaults leave the flash untouched outside the written ranges and the
/// image headers as built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlashOptions {
    /// Flash size written into the bootloader header.
    pub flash_size: Option<FlashSize>,
    /// Flash frequency written into the bootloader header.
    pub flash_freq: Option<FlashFrequency>,
    /// Flash mode written into the bootloader header.
    pub flash_mode: Option<FlashMode>,
    /// Erase the whole chip once before writing.
    pub erase_all: bool,
    /// Send zlib-compressed blocks.
    pub compress: bool,
    /// Keep going after a request fails.
    pub continue_on_error: bool,
}

impl FlashOptions {
    /// Header overrides derived from the geometry fields.
    pub fn settings(&self) -> FlashSettings {
        FlashSettings {
            size: self.flash_size,
            freq: self.flash_freq,
            mode: self.flash_mode,
        }
    }
}

/// Ordered list of requests executed strictly in sequence.
#[derive(Debug, Clone, Default)]
pub struct FlashJob {
    requests: Vec<FlashRequest>,
    options: FlashOptions,
}

impl FlashJob {
    /// Create a job with default options.
    pub fn new(requests: Vec<FlashRequest>) -> Self {
        Self {
            requests,
            options: FlashOptions::default(),
        }
    }

    /// Replace the options.
    #[must_use]
    pub fn with_options(mut self, options: FlashOptions) -> Self {
        self.options = options;
        self
    }

    /// Append a request.
    pub fn push(&mut self, request: FlashRequest) {
        self.requests
            .push(request);
    }

    /// Requests in execution order.
    pub fn requests(&self) -> &[FlashRequest] {
        &self.requests
    }

    /// Job options.
    pub fn options(&self) -> &FlashOptions {
        &self.options
    }

    /// Total image bytes across requests.
    pub fn total_bytes(&self) -> usize {
        self.requests
            .iter()
            .map(|r| {
                r.data
                    .len()
            })
            .sum()
    }

    /// Check the layout: at least one request, no empty image, every range
    /// inside the 32-bit address space and no two ranges overlapping.
    pub fn validate(&self) -> Result<()> {
        if self
            .requests
            .is_empty()
        {
            return Err(Error::InvalidJobLayout("job has no requests".into()));
        }

        for (index, request) in self
            .requests
            .iter()
            .enumerate()
        {
            if request
                .data
                .is_empty()
            {
                return Err(Error::InvalidJobLayout(format!(
                    "request {index} at 0x{:08X} is empty",
                    request.address
                )));
            }
            if request.end() > 1 << 32 {
                return Err(Error::InvalidJobLayout(format!(
                    "request {index} at 0x{:08X} ({} bytes) runs past the 32-bit address space",
                    request.address,
                    request
                        .data
                        .len()
                )));
            }
        }

        let mut order: Vec<usize> = (0..self
            .requests
            .len())
            .collect();
        order.sort_by_key(|&i| self.requests[i].address);
        for pair in order.windows(2) {
            let (a, b) = (&self.requests[pair[0]], &self.requests[pair[1]]);
            if a.end() > u64::from(b.address) {
                return Err(Error::InvalidJobLayout(format!(
                    "requests {} [0x{:08X}, 0x{:08X}) and {} [0x{:08X}, 0x{:08X}) overlap",
                    pair[0],
                    a.address,
                    a.end(),
                    pair[1],
                    b.address,
                    b.end()
                )));
            }
        }
        Ok(())
    }
}

/// Progress of the request currently being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressState {
    /// Index of the active request.
    pub index: usize,
    /// Bytes of it acknowledged so far.
    pub written: usize,
    /// Its total size.
    pub total: usize,
}

impl ProgressState {
    /// Completion of the active request, 0 to 100.
    #[allow(clippy::cast_possible_truncation)]
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        // Safe cast: clamped to 100
        (self.written as u64 * 100 / self.total as u64).min(100) as u8
    }
}

/// Runs flash jobs on a session and reports to a front end.
pub struct FlashCoordinator<O: PortOpener> {
    session: Session<O>,
    progress: Option<ProgressState>,
}

impl<O: PortOpener> FlashCoordinator<O> {
    /// Create a coordinator around `session`.
    pub fn new(session: Session<O>) -> Self {
        Self {
            session,
            progress: None,
        }
    }

    /// The session.
    pub fn session(&self) -> &Session<O> {
        &self.session
    }

    /// The session, mutably (for resets and erases outside a job).
    pub fn session_mut(&mut self) -> &mut Session<O> {
        &mut self.session
    }

    /// Consume the coordinator and return its session.
    pub fn into_session(self) -> Session<O> {
        self.session
    }

    /// Progress of the last acknowledged block.
    pub fn progress(&self) -> Option<ProgressState> {
        self.progress
    }

    /// Validate and run `job`, connecting first if needed.
    ///
    /// `on_log` receives human-readable lines, `on_progress` the index of
    /// the active request and its completion percentage. A layout problem
    /// fails with `InvalidJobLayout` before any I/O; every later failure is
    /// reported as `FlashJobFailed` naming the request it happened on.
    pub fn run<L, P>(
        &mut self,
        job: &FlashJob,
        mut on_log: L,
        mut on_progress: P,
    ) -> Result<FlashReport>
    where
        L: FnMut(&str),
        P: FnMut(usize, u8),
    {
        if let Err(e) = job.validate() {
            on_log(&format!("{}: {e}", e.kind()));
            return Err(e);
        }
        self.progress = None;

        if self
            .session
            .state()
            != SessionState::Ready
        {
            on_log("Connecting...");
            match self
                .session
                .connect()
            {
                Ok(chip) => on_log(&format!("Connected to {chip}")),
                Err(e) => return Err(fail(0, e, &mut on_log)),
            }
        }

        let requests = job.requests();
        let describe = |index: usize| {
            let request = &requests[index];
            format!(
                "Writing request {index} ({} bytes at 0x{:08X})...",
                request
                    .data
                    .len(),
                request.address
            )
        };

        let mut active = 0usize;
        on_log(&describe(0));

        let progress = &mut self.progress;
        let result = self
            .session
            .write_flash(job, |index, written, total| {
                if index != active {
                    active = index;
                    on_log(&describe(index));
                }

                let state = ProgressState {
                    index,
                    written,
                    total,
                };
                *progress = Some(state);
                on_progress(index, state.percent());

                if written >= total {
                    on_log(&format!("Request {index} complete"));
                    if index + 1 < requests.len() {
                        active = index + 1;
                        on_log(&describe(active));
                    }
                }
            });

        match result {
            Ok(report) if report.is_success() => {
                debug!("Job finished: {} request(s) written", report.completed.len());
                Ok(report)
            },
            Ok(mut report) => {
                for (index, e) in &report.failed {
                    on_log(&format!("{}: request {index}: {e}", e.kind()));
                }
                let (index, source) = report
                    .failed
                    .remove(0);
                Err(Error::FlashJobFailed {
                    index,
                    source: Box::new(source),
                })
            },
            Err(e) => {
                let index = match e {
                    Error::FlashWrite { request, .. } => request,
                    _ => active,
                };
                Err(fail(index, e, &mut on_log))
            },
        }
    }
}

fn fail<L: FnMut(&str)>(index: usize, source: Error, on_log: &mut L) -> Error {
    on_log(&format!("{}: {source}", source.kind()));
    Error::FlashJobFailed {
        index,
        source: Box::new(source),
    }
}
