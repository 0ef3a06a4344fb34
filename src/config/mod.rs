//! Bootstrap configuration.
//!
//! The file is line oriented. Empty lines and lines starting with `#` are
//! ignored, every other line is a directive:
//!
//! ```text
//! control /run/portmux.sock
//! forward TCP::8000 to TCP:example.org:80
//! forward UDP:127.0.0.1:5353 to UDP:10.0.0.1:53
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;

mod parse;
use self::parse::{Parse, parse_stream};

pub mod forward;

use self::forward::Forward;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Config {
    /// Path of the control socket.
    pub control: Option<PathBuf>,
    pub forward: Vec<Forward>,
}

impl Config {
    pub async fn read<P>(path: P) -> eyre::Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let data = tokio::fs::read_to_string(path).await?;
        let x = data.parse()?;
        Ok(x)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseControlError {
    #[error("expected a socket path")]
    ExpectedPath,

    #[error("unexpected argument '{0}'")]
    Unexpected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    Control(ParseControlError),
    Forward(forward::ParseForwardError),
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Control(x) => x.fmt(f),
            Self::Forward(x) => x.fmt(f),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {kind}")]
pub struct ParseError {
    pub line: usize,
    pub kind: ParseErrorKind,
}

impl FromStr for Config {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut control = None;
        let mut forward = Vec::new();

        let lines = s
            .lines()
            .map(str::trim)
            .enumerate()
            .filter(|(_, line)| !line.is_empty())
            .filter(|(_, line)| !line.starts_with('#'));

        for (i, line) in lines {
            let parse_error =
                |kind: ParseErrorKind| -> ParseError { ParseError { line: i + 1, kind } };

            let mut stream = parse_stream(line);

            let Some(directive) = stream.next() else {
                continue;
            };

            match directive {
                "control" => {
                    let path = stream
                        .next()
                        .ok_or(ParseControlError::ExpectedPath)
                        .map_err(ParseErrorKind::Control)
                        .map_err(parse_error)?;

                    if let Some(x) = stream.next() {
                        let kind = ParseErrorKind::Control(ParseControlError::Unexpected(
                            x.to_owned(),
                        ));
                        return Err(parse_error(kind));
                    }

                    control = Some(PathBuf::from(path));
                }

                "forward" => {
                    let x = Forward::parse(&mut stream)
                        .map_err(ParseErrorKind::Forward)
                        .map_err(parse_error)?;

                    forward.push(x);
                }

                x => {
                    warn!("skipping unknown directive '{x}'")
                }
            }
        }

        Ok(Self { control, forward })
    }
}

#[cfg(test)]
mod tests {
    use super::forward::ParseForwardError;
    use super::*;
    use crate::endpoint::{Endpoint, ParseEndpointError};

    #[test]
    fn parse_config() {
        let config: Config = r#"
            # comment
            control /run/portmux.sock

            forward TCP::8000 to TCP:example.org:80
            forward udp:127.0.0.1:5353 to UDP:10.0.0.1:53
            frobnicate everything
        "#
        .parse()
        .unwrap();

        assert_eq!(config.control, Some(PathBuf::from("/run/portmux.sock")));
        assert_eq!(
            config.forward,
            vec![
                Forward {
                    src: Endpoint::tcp("", 8000),
                    dest: Endpoint::tcp("example.org", 80),
                },
                Forward {
                    src: Endpoint::udp("127.0.0.1", 5353),
                    dest: Endpoint::udp("10.0.0.1", 53),
                },
            ]
        );
    }

    #[test]
    fn empty_config() {
        let config: Config = "\n  \n# nothing here\n".parse().unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn errors_carry_the_line_number() {
        let e = "# header\n\nforward TCP::80 TCP::81"
            .parse::<Config>()
            .unwrap_err();
        assert_eq!(
            e,
            ParseError {
                line: 3,
                kind: ParseErrorKind::Forward(ParseForwardError::ExpectedTo),
            }
        );
        assert_eq!(e.to_string(), "line 3: expected literal 'to'");
    }

    #[test]
    fn forward_errors() {
        let kind = |s: &str| s.parse::<Config>().unwrap_err().kind;

        assert_eq!(
            kind("forward"),
            ParseErrorKind::Forward(ParseForwardError::ExpectedSource)
        );
        assert_eq!(
            kind("forward TCP::80 to"),
            ParseErrorKind::Forward(ParseForwardError::ExpectedDestination)
        );
        assert_eq!(
            kind("forward SCTP::80 to TCP::81"),
            ParseErrorKind::Forward(ParseForwardError::InvalidSource(
                ParseEndpointError::UnknownProtocol("SCTP".into())
            ))
        );
        assert!(matches!(
            kind("forward TCP::80 to TCP::port"),
            ParseErrorKind::Forward(ParseForwardError::InvalidDestination(
                ParseEndpointError::InvalidPort(_)
            ))
        ));
        assert_eq!(
            kind("forward TCP::80 to TCP::81 now"),
            ParseErrorKind::Forward(ParseForwardError::Unexpected("now".into()))
        );
    }

    #[test]
    fn control_errors() {
        let kind = |s: &str| s.parse::<Config>().unwrap_err().kind;

        assert_eq!(
            kind("control"),
            ParseErrorKind::Control(ParseControlError::ExpectedPath)
        );
        assert_eq!(
            kind("control /a /b"),
            ParseErrorKind::Control(ParseControlError::Unexpected("/b".into()))
        );
    }
}
