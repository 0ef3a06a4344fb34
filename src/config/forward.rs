use thiserror::Error;

use super::parse::{Parse, ParseStream, literal};
use crate::endpoint::{Endpoint, ParseEndpointError};

/// `forward <portspec> to <portspec>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forward {
    pub src: Endpoint,
    pub dest: Endpoint,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseForwardError {
    #[error("expected a source portspec")]
    ExpectedSource,

    #[error("invalid source portspec: {0}")]
    InvalidSource(ParseEndpointError),

    #[error("expected literal 'to'")]
    ExpectedTo,

    #[error("expected a destination portspec")]
    ExpectedDestination,

    #[error("invalid destination portspec: {0}")]
    InvalidDestination(ParseEndpointError),

    #[error("unexpected argument '{0}'")]
    Unexpected(String),
}

impl Parse for Forward {
    type Output = Self;
    type Error = ParseForwardError;

    fn parse(stream: &mut ParseStream<'_>) -> Result<Self::Output, Self::Error> {
        use ParseForwardError::*;

        let src = stream
            .next()
            .ok_or(ExpectedSource)?
            .parse()
            .map_err(InvalidSource)?;

        if !literal(stream, "to") {
            return Err(ExpectedTo);
        }

        let dest = stream
            .next()
            .ok_or(ExpectedDestination)?
            .parse()
            .map_err(InvalidDestination)?;

        if let Some(x) = stream.next() {
            return Err(Unexpected(x.to_owned()));
        }

        Ok(Self { src, dest })
    }
}
