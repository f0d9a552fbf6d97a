use std::io::{self, Write};
use std::time::Instant;

/// Timestamped stage lines on stderr; silent when disabled (`--quiet`).
pub struct ConsoleProgress {
    enabled: bool,
    t0: Instant,
    total_stages: usize,
}

impl ConsoleProgress {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            t0: Instant::now(),
            total_stages: 0,
        }
    }

    /// Number stages against `total` from now on.
    pub fn with_stages(mut self, total: usize) -> Self {
        self.total_stages = total;
        self
    }

    pub fn info(&self, msg: impl AsRef<str>) {
        if !self.enabled {
            return;
        }
        let ts = fmt_elapsed(self.t0.elapsed().as_secs_f64());
        let mut stderr = io::stderr().lock();
        let _ = writeln!(stderr, "[{ts}] {}", msg.as_ref());
    }

    /// One pipeline stage, as `[mm:ss] [step/total] msg`.
    pub fn stage(&self, step: usize, msg: impl AsRef<str>) {
        if !self.enabled {
            return;
        }
        if self.total_stages == 0 {
            self.info(msg);
            return;
        }
        let total = self.total_stages;
        let step = step.clamp(1, total);
        let ts = fmt_elapsed(self.t0.elapsed().as_secs_f64());
        let mut stderr = io::stderr().lock();
        let _ = writeln!(stderr, "[{ts}] [{step}/{total}] {}", msg.as_ref());
    }
}

fn fmt_elapsed(seconds: f64) -> String {
    let seconds = seconds.max(0.0) as u64;
    let h = seconds / 3600;
    let m = (seconds % 3600) / 60;
    let s = seconds % 60;
    if h > 0 {
        format!("{h:02}:{m:02}:{s:02}")
    } else {
        format!("{m:02}:{s:02}")
    }
}
