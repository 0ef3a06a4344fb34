use std::fmt::{self, Display, Formatter, Result};

use owo_colors::OwoColorize;

use crate::endpoint::{Endpoint, Mapping};

#[doc(hidden)]
pub struct DebugDisplay<T>(T);

impl<T> Display for DebugDisplay<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

#[doc(hidden)]
#[expect(non_camel_case_types)]
pub struct _display<'a, T: ?Sized>(pub &'a T);

impl<T: ?Sized> Display for _display<'_, &T>
where
    for<'b> _display<'b, T>: Display,
{
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        _display(*self.0).fmt(f)
    }
}

macro_rules! display {
    ($x:expr) => {{ $crate::display::_display(&$x) }};
}

impl Display for _display<'_, std::io::Error> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        self.0.bright_red().fmt(f)
    }
}

impl Display for _display<'_, mio::Token> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        DebugDisplay(self.0.0).dimmed().fmt(f)
    }
}

impl Display for _display<'_, std::net::SocketAddr> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        self.0.bright_yellow().fmt(f)
    }
}

impl Display for _display<'_, Endpoint> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        self.0.bright_yellow().fmt(f)
    }
}

impl Display for _display<'_, Mapping> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{} -> {}", display!(self.0.src), display!(self.0.dest))
    }
}

impl Display for _display<'_, std::time::Duration> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        DebugDisplay(self.0).bright_blue().fmt(f)
    }
}

impl Display for _display<'_, std::path::PathBuf> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        self.0.display().bright_cyan().fmt(f)
    }
}
