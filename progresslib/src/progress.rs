mod format;

use format::{BinarySize, ClockDuration};

use std::{
    collections::VecDeque,
    io::{self, Write},
    time::{Duration, Instant},
};

use crossterm::{
    cursor::{Hide, MoveToColumn, Show},
    QueueableCommand,
    style::{Print, Stylize},
    terminal::{self, Clear, ClearType},
    tty::IsTty,
};

/// Window over which the transfer speed is averaged.
const SPEED_WINDOW: Duration = Duration::from_secs(10);

/// Moving average of a progress value over a fixed window of time.
#[derive(Debug)]
struct SpeedMeter {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl SpeedMeter {
    fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    fn reset(&mut self) {
        self.samples.clear();
    }

    fn record(&mut self, value: u64) {
        let now = Instant::now();
        self.samples.push_back((now, value));

        // Keep one sample older than the window so that the average always
        // spans the full window
        while self.samples.len() > 2 && now - self.samples[1].0 >= self.window {
            self.samples.pop_front();
        }
    }

    fn units_per_sec(&self) -> f64 {
        match (self.samples.front(), self.samples.back()) {
            (Some(f), Some(b)) if b.0 > f.0 => {
                b.1.saturating_sub(f.1) as f64 / (b.0 - f.0).as_secs_f64()
            }
            _ => 0.0,
        }
    }
}

/// How the progress bar should be drawn
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressDrawMode {
    /// Redraw the same line on every frame. Used for interactive terminals.
    /// The default rate is 15 fps.
    Interactive,
    /// Print a new line on every frame. Used when the output is redirected or
    /// when log messages are interleaved with the progress. The default rate
    /// is 0.2 fps.
    Append,
    /// Do not draw anything.
    None,
}

impl ProgressDrawMode {
    fn default_fps(self) -> f64 {
        match self {
            Self::Interactive => 15.0,
            Self::Append => 0.2,
            Self::None => 0.0,
        }
    }

    fn detect(term: &impl IsTty) -> Self {
        if term.is_tty() {
            Self::Interactive
        } else {
            Self::Append
        }
    }
}

/// Byte progress bar for downloads. Shows the elapsed time, a bar, the
/// percentage, the current and total size, the speed, the ETA, and an optional
/// label (eg. the chunk being downloaded).
pub struct ProgressBar<T: Write + IsTty> {
    len: u64,
    pos: u64,
    label: Option<String>,
    term: T,
    mode: ProgressDrawMode,
    /// Maximum frames per second. 0 means every update is drawn
    fps: f64,
    last_draw: Option<Instant>,
    started: Instant,
    speed: SpeedMeter,
}

impl<T: Write + IsTty> ProgressBar<T> {
    /// Construct a new progress bar. Nothing is drawn until the state changes.
    pub fn new(term: T, len: u64) -> Self {
        let mode = ProgressDrawMode::detect(&term);

        Self {
            len,
            pos: 0,
            label: None,
            term,
            mode,
            fps: mode.default_fps(),
            last_draw: None,
            started: Instant::now(),
            speed: SpeedMeter::new(SPEED_WINDOW),
        }
    }

    pub fn mode(&self) -> ProgressDrawMode {
        self.mode
    }

    /// Set the draw mode. `None` picks [`ProgressDrawMode::Interactive`] or
    /// [`ProgressDrawMode::Append`] depending on whether the terminal is
    /// interactive. The fps is reset to the mode's default.
    pub fn set_mode(&mut self, mode: Option<ProgressDrawMode>) {
        self.mode = mode.unwrap_or_else(|| ProgressDrawMode::detect(&self.term));
        self.fps = self.mode.default_fps();
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn set_fps(&mut self, fps: f64) {
        self.fps = fps;
    }

    pub fn length(&self) -> u64 {
        self.len
    }

    /// Set the maximum value. This performs an immediate redraw.
    pub fn set_length(&mut self, len: u64) -> io::Result<()> {
        self.len = len;
        self.draw(true)
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Set the current value without affecting the speed calculation. Used
    /// for data that was already present before the transfer started. This
    /// performs an immediate redraw.
    pub fn set_position(&mut self, pos: u64) -> io::Result<()> {
        self.pos = pos;
        self.speed.reset();
        self.speed.record(pos);
        self.draw(true)
    }

    /// Advance the current value. The redraw is rate limited.
    pub fn advance(&mut self, delta: u64) -> io::Result<()> {
        self.pos = self.pos.saturating_add(delta);
        self.speed.record(self.pos);
        self.draw(false)
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Set the text shown after the progress. This performs an immediate
    /// redraw.
    pub fn set_label(&mut self, label: Option<String>) -> io::Result<()> {
        self.label = label;
        self.draw(true)
    }

    /// Print a line without clobbering the progress bar.
    pub fn println(&mut self, msg: impl Into<String>) -> io::Result<()> {
        match self.mode {
            ProgressDrawMode::None => Ok(()),
            ProgressDrawMode::Append => {
                self.term
                    .queue(Print(msg.into()))?
                    .queue(Print('\n'))?
                    .flush()
            }
            ProgressDrawMode::Interactive => {
                self.term
                    .queue(Clear(ClearType::CurrentLine))?
                    .queue(MoveToColumn(0))?
                    .queue(Print(msg.into()))?
                    .queue(Print('\n'))?;
                self.draw(true)
            }
        }
    }

    /// Draw the final frame. In interactive mode, the bar is cleared from the
    /// terminal. This is called automatically when the bar is dropped.
    pub fn finish(&mut self) -> io::Result<()> {
        match self.mode {
            ProgressDrawMode::Interactive => {
                self.term
                    .queue(Clear(ClearType::CurrentLine))?
                    .queue(MoveToColumn(0))?
                    .queue(Show)?
                    .flush()
            }
            ProgressDrawMode::Append => self.draw(true),
            ProgressDrawMode::None => Ok(()),
        }
    }

    /// Draw the progress bar. Unless `force` is set, nothing is drawn if the
    /// previous frame was drawn less than one frame period ago.
    pub fn draw(&mut self, force: bool) -> io::Result<()> {
        if self.mode == ProgressDrawMode::None {
            return Ok(());
        }

        if !force && self.fps > 0.0 {
            if let Some(last) = self.last_draw {
                if last.elapsed() < Duration::from_secs_f64(1.0 / self.fps) {
                    return Ok(());
                }
            }
        }

        let line = self.render();

        if self.mode == ProgressDrawMode::Interactive {
            self.term
                .queue(Hide)?
                .queue(Clear(ClearType::CurrentLine))?
                .queue(MoveToColumn(0))?
                .queue(Print(line))?;
        } else {
            self.term
                .queue(Print(line))?
                .queue(Print('\n'))?;
        }
        self.term.flush()?;

        self.last_draw = Some(Instant::now());

        Ok(())
    }

    fn ratio(&self) -> f64 {
        if self.len == 0 {
            0.0
        } else {
            (self.pos as f64 / self.len as f64).clamp(0.0, 1.0)
        }
    }

    fn render(&self) -> String {
        let ratio = self.ratio();
        let speed = self.speed.units_per_sec();
        let eta = if speed > 0.0 {
            self.len.saturating_sub(self.pos) as f64 / speed
        } else {
            0.0
        };
        let elapsed = self.started.elapsed().as_secs();

        let prefix = format!("[{}] ", ClockDuration(Duration::from_secs(elapsed)));
        let mut suffix = format!(
            "{:.0}% {}/{} ({}/s, ETA {})",
            ratio * 100.0,
            BinarySize(self.pos),
            BinarySize(self.len),
            BinarySize(speed as u64),
            ClockDuration(Duration::from_secs(eta as u64)),
        );
        if let Some(label) = &self.label {
            suffix.push(' ');
            suffix.push_str(label);
        }

        if self.mode != ProgressDrawMode::Interactive {
            return prefix + &suffix;
        }

        let width = terminal::size().map(|(w, _)| w as usize).unwrap_or(80);
        // One extra column for the space after the bar
        let bar_width = width.saturating_sub(prefix.len() + suffix.len() + 1);
        if bar_width == 0 {
            return prefix + &suffix;
        }

        let done = (ratio * bar_width as f64).round() as usize;

        format!(
            "{prefix}{}{} {suffix}",
            "#".repeat(done).cyan(),
            "-".repeat(bar_width - done).blue(),
        )
    }
}

impl<T: Write + IsTty> Drop for ProgressBar<T> {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}
