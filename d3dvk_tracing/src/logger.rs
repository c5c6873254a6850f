use std::fmt::{self, Debug, Display, Formatter, Write};
use std::io::IsTerminal;

use chrono::Local;
use tracing::field::{Field, Visit};
use tracing::metadata::LevelFilter;
use tracing::subscriber::{set_global_default, SetGlobalDefaultError};
use tracing::{Event, Level, Metadata, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Environment variable read by [`Logger::from_env`].
pub const LOG_ENV: &str = "RUST_LOG";

/// Installs a global subscriber that writes events to stdout.
///
/// If `level` is `None` the level is taken from the `RUST_LOG` environment
/// variable.
pub fn init(level: Option<LevelFilter>) -> Result<(), SetGlobalDefaultError> {
    let logger = match level {
        Some(level) => Logger::new(level),
        None => Logger::from_env(),
    };

    let subscriber = tracing_subscriber::registry().with(logger);
    set_global_default(subscriber)
}

/// Parses a level name as accepted in `RUST_LOG`.
pub fn parse_level(value: &str) -> Option<LevelFilter> {
    let level = match value.trim().to_ascii_lowercase().as_str() {
        "error" => LevelFilter::ERROR,
        "warn" => LevelFilter::WARN,
        "info" => LevelFilter::INFO,
        "debug" => LevelFilter::DEBUG,
        "trace" => LevelFilter::TRACE,
        "off" => LevelFilter::OFF,
        _ => return None,
    };

    Some(level)
}

#[derive(Debug)]
pub struct Logger {
    is_tty: bool,
    level: LevelFilter,
}

impl Logger {
    pub fn new(level: LevelFilter) -> Self {
        Self {
            is_tty: std::io::stdout().is_terminal(),
            level,
        }
    }

    pub fn from_env() -> Self {
        let level = std::env::var(LOG_ENV)
            .ok()
            .and_then(|value| parse_level(&value))
            .unwrap_or(LevelFilter::INFO);

        Self::new(level)
    }

    pub fn level(&self) -> LevelFilter {
        self.level
    }

    fn log(&self, level: Level, target: &str, content: &Visitor) {
        let now = Local::now().format("%Y-%m-%d %H:%M:%S:%f");

        let (name, color) = match level {
            Level::ERROR => ("ERROR", Color::RED),
            Level::WARN => ("WARN", Color::YELLOW),
            Level::INFO => ("INFO", Color::GREEN),
            Level::DEBUG => ("DEBUG", Color::LIGHT_GRAY_BOLD),
            Level::TRACE => ("TRACE", Color::LIGHT_GRAY_BOLD),
        };

        if self.is_tty {
            let now = ColorText::new(format!("[{}]", now), Color::LIGHT_GRAY);
            let name = ColorText::new(name, color);
            let target = ColorText::new(target, Color::LIGHT_GRAY);

            println!("{} {} {} {}", now, name, target, content);
        } else {
            println!("[{}] {} {} {}", now, name, target, content);
        }
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::from_env()
    }
}

impl<S> Layer<S> for Logger
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn enabled(&self, metadata: &Metadata<'_>, _ctx: Context<'_, S>) -> bool {
        *metadata.level() <= self.level
    }

    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if *metadata.level() > self.level {
            return;
        }

        let mut visitor = Visitor::new();
        event.record(&mut visitor);

        let target = metadata.module_path().unwrap_or(metadata.target());
        self.log(*metadata.level(), target, &visitor);
    }
}

struct Visitor {
    buf: String,
}

impl Visitor {
    fn new() -> Self {
        Self {
            buf: String::with_capacity(32),
        }
    }
}

impl Visit for Visitor {
    fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
        if !self.buf.is_empty() {
            self.buf.push(' ');
        }

        let _ = match field.name() {
            "message" => write!(self.buf, "{:?}", value),
            _ => write!(self.buf, "{} = {:?}", field, value),
        };
    }
}

impl Display for Visitor {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.buf, f)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
struct Color([u8; 2]);

impl Color {
    // Bold
    const RED: Self = Self([1, 31]);
    const YELLOW: Self = Self([1, 33]);
    const GREEN: Self = Self([1, 32]);
    const LIGHT_GRAY_BOLD: Self = Self([1, 37]);

    const LIGHT_GRAY: Self = Self([2, 37]);
}

struct ColorText<T> {
    text: T,
    color: Color,
}

impl<T> ColorText<T>
where
    T: Display,
{
    fn new(text: T, color: Color) -> Self {
        Self { text, color }
    }
}

impl<T> Display for ColorText<T>
where
    T: Display,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "\x1b[{};{}m{}\x1b[0m",
            self.color.0[0], self.color.0[1], self.text
        )
    }
}
