use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::utils::u32_to_dotted;

/// A standard (RFC 1997) community value.
///
/// Accepts either "ASN:value" (each half 16 bits) or a plain decimal
/// 32-bit literal (E.g. "4259840100").
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Community(pub u32);

impl fmt::Display for Community {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u32_to_dotted(self.0, ':'))
    }
}

impl TryFrom<&str> for Community {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let chunks: Vec<_> = value.split(':').collect();
        match chunks.len() {
            1 => chunks[0]
                .parse::<u32>()
                .map(Community)
                .map_err(|_| Error::ConfigInvalid(format!("invalid community '{}'", value))),
            2 => {
                let (asn, local) = (
                    chunks[0].parse::<u16>().map_err(|_| {
                        Error::ConfigInvalid(format!("invalid community '{}'", value))
                    })?,
                    chunks[1].parse::<u16>().map_err(|_| {
                        Error::ConfigInvalid(format!("invalid community '{}'", value))
                    })?,
                );
                Ok(Community((u32::from(asn) << 16) | u32::from(local)))
            }
            _ => Err(Error::ConfigInvalid(format!(
                "invalid community '{}'",
                value
            ))),
        }
    }
}

impl FromStr for Community {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Community::try_from(value)
    }
}

/// A large (RFC 8092) community, three 32-bit words written "asn:l1:l2".
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct LargeCommunity {
    pub asn: u32,
    pub local_data1: u32,
    pub local_data2: u32,
}

impl fmt::Display for LargeCommunity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.asn, self.local_data1, self.local_data2)
    }
}

impl TryFrom<&str> for LargeCommunity {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let chunks: Vec<_> = value.split(':').collect();
        if chunks.len() != 3 {
            return Err(Error::ConfigInvalid(format!(
                "invalid large community '{}'",
                value
            )));
        }
        let mut words = [0u32; 3];
        for (word, chunk) in words.iter_mut().zip(chunks.iter()) {
            *word = chunk.parse::<u32>().map_err(|_| {
                Error::ConfigInvalid(format!("invalid large community '{}'", value))
            })?;
        }
        Ok(LargeCommunity {
            asn: words[0],
            local_data1: words[1],
            local_data2: words[2],
        })
    }
}

impl FromStr for LargeCommunity {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        LargeCommunity::try_from(value)
    }
}
