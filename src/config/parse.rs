use std::iter::Peekable;

use miniarg::split_args::SplitArgs;

pub type ParseStream<'a> = Peekable<SplitArgs<'a>>;

pub fn parse_stream(s: &str) -> ParseStream<'_> {
    SplitArgs::new(s).peekable()
}

/// A directive that knows how to read its arguments off a line.
pub trait Parse {
    type Output;
    type Error;

    fn parse(stream: &mut ParseStream<'_>) -> Result<Self::Output, Self::Error>;
}

/// Consume the next token if it is `word`.
pub fn literal(stream: &mut ParseStream<'_>, word: &str) -> bool {
    stream.next_if_eq(&word).is_some()
}
