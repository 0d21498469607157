//! Core types - Wire enums with one explicit string table each
//!
//! Every enum that crosses the bus or the client socket is a plain sum type
//! plus a `TABLE` mapping variants to their fixed tokens. Parsing and
//! printing both go through that table.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Token that matched no entry of a wire table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} token: {token}")]
pub struct UnknownToken {
    pub kind: &'static str,
    pub token: String,
}

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident => $token:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            pub const TABLE: &'static [($name, &'static str)] = &[$(($name::$variant, $token)),+];

            pub fn as_str(self) -> &'static str {
                Self::TABLE
                    .iter()
                    .find(|(v, _)| *v == self)
                    .map(|(_, t)| *t)
                    .unwrap_or("")
            }
        }

        impl FromStr for $name {
            type Err = UnknownToken;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::TABLE
                    .iter()
                    .find(|(_, t)| *t == s)
                    .map(|(v, _)| *v)
                    .ok_or_else(|| UnknownToken { kind: stringify!($name), token: s.to_string() })
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let token = String::deserialize(deserializer)?;
                token.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

wire_enum!(
    /// Order side
    Direction { Buy => "BUY", Sell => "SELL" }
);

wire_enum!(
    /// Open or close intent of an order
    Offset { Open => "OPEN", Close => "CLOSE", CloseToday => "CLOSETODAY" }
);

wire_enum!(
    #[derive(Default)]
    PriceType { #[default] Limit => "LIMIT", Any => "ANY", Best => "BEST", FiveLevel => "FIVELEVEL" }
);

wire_enum!(
    #[derive(Default)]
    VolumeCondition { #[default] Any => "ANY", Min => "MIN", All => "ALL" }
);

wire_enum!(
    #[derive(Default)]
    TimeCondition {
        Ioc => "IOC",
        Gfs => "GFS",
        #[default]
        Gfd => "GFD",
        Gtd => "GTD",
        Gtc => "GTC",
        Gfa => "GFA",
    }
);

wire_enum!(
    /// Order lifecycle. FINISHED is terminal.
    OrderStatus { Alive => "ALIVE", Finished => "FINISHED" }
);

wire_enum!(
    ProductClass {
        Futures => "FUTURES",
        Options => "OPTION",
        Combine => "COMBINE",
        Index => "INDEX",
        Spot => "SPOT",
    }
);

wire_enum!(
    /// Severity attached to client notifications
    NoticeLevel { Info => "INFO", Warning => "WARNING", Error => "ERROR" }
);

wire_enum!(
    /// Backend family selected by a broker entry; each maps to one worker executable.
    BrokerType {
        Ctp => "ctp",
        CtpSe13 => "ctpse13",
        CtpSe => "ctpse",
        Sim => "sim",
        PerfTest => "perftest",
    }
);

impl BrokerType {
    /// Worker executable launched for this backend.
    pub fn worker_program(self) -> &'static str {
        match self {
            BrokerType::Ctp => "trade-ctp",
            BrokerType::CtpSe13 => "trade-ctpse",
            BrokerType::CtpSe => "trade-ctpse15",
            BrokerType::Sim => "trade-sim",
            BrokerType::PerfTest => "trade-perftest",
        }
    }
}
