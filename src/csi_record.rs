//! The CSI packet line grammar and the record that ends up in a session CSV.
//!
//! A radio prints one packet per line:
//!
//! ```text
//! CSI_DATA,37,c0:5d:89:de:0d:85,-74,11,1,4,0,1,1,1,0,0,0,-97,1,1,2,30198,0,89,0,128,0,[89,16,5,0]
//! ```
//!
//! That is the marker, 23 scalar fields, and the subcarrier payload as a
//! bracketed integer list (some firmware builds wrap it in double quotes).
//! Prepending the host timestamp gives the 25 columns of [HEADER].

use chrono::Local;
use nom::{
    bytes::complete::{tag, take_while1},
    character::complete::{char, i64, space0},
    combinator::{all_consuming, recognize},
    error::Error,
    multi::{count, separated_list0},
    sequence::{delimited, pair, preceded, terminated},
    Finish, IResult,
};
use std::str::FromStr;

/// Literal prefix of every packet line.
pub const MARKER: &str = "CSI_DATA,";

/// Column names of a session CSV, in order.
pub const HEADER: [&str; 25] = [
    "timestamp",
    "id",
    "mac",
    "rssi",
    "rate",
    "sig_mode",
    "mcs",
    "bandwidth",
    "smoothing",
    "not_sounding",
    "aggregation",
    "stbc",
    "fec_coding",
    "sgi",
    "noise_floor",
    "ampdu_cnt",
    "channel",
    "secondary_channel",
    "local_timestamp",
    "ant",
    "sig_len",
    "rx_state",
    "len",
    "first_word",
    "data",
];

/// Column index of the RSSI in a CSV row.
pub const RSSI_COLUMN: usize = 3;

const SCALAR_FIELDS: usize = 23;

/// One packet line, without the host timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsiPacket {
    fields: Vec<String>,
    data: String,
}

fn scalar(s: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c != ',' && c != '[' && c != ']' && c != '"')(s)
}

fn bracketed_list(s: &str) -> IResult<&str, &str> {
    recognize(delimited(
        char('['),
        separated_list0(char(','), delimited(space0, i64, space0)),
        char(']'),
    ))(s)
}

fn payload(s: &str) -> IResult<&str, &str> {
    if s.starts_with('"') {
        delimited(char('"'), bracketed_list, char('"'))(s)
    } else {
        bracketed_list(s)
    }
}

fn parse_csi_line(s: &str) -> IResult<&str, (Vec<&str>, &str)> {
    all_consuming(terminated(
        preceded(
            tag(MARKER),
            pair(
                count(terminated(scalar, char(',')), SCALAR_FIELDS),
                payload,
            ),
        ),
        space0,
    ))(s)
}

impl FromStr for CsiPacket {
    type Err = Error<String>;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match parse_csi_line(s.trim_end()).finish() {
            Ok((_remaining, (fields, data))) => Ok(CsiPacket {
                fields: fields.into_iter().map(str::to_owned).collect(),
                data: data.to_owned(),
            }),
            Err(Error { input, code }) => Err(Error {
                input: input.to_string(),
                code,
            }),
        }
    }
}

impl CsiPacket {
    /// Sequence id as printed by the radio.
    pub fn id(&self) -> &str {
        &self.fields[0]
    }

    /// Source MAC address.
    pub fn mac(&self) -> &str {
        &self.fields[1]
    }

    /// The RSSI column exactly as received.
    pub fn rssi_field(&self) -> &str {
        &self.fields[RSSI_COLUMN - 1]
    }

    /// The RSSI in dBm, if the column is an integer.
    pub fn rssi(&self) -> Option<i32> {
        self.rssi_field().trim().parse().ok()
    }

    /// Wi-Fi channel.
    pub fn channel(&self) -> &str {
        &self.fields[15]
    }

    /// The raw subcarrier payload, brackets included.
    pub fn data(&self) -> &str {
        &self.data
    }

    /// Attach a host timestamp, producing a row-ready record.
    pub fn stamp(self, timestamp: String) -> CsiRecord {
        CsiRecord {
            timestamp,
            packet: self,
        }
    }
}

/// A timestamped packet, one row of a session CSV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsiRecord {
    /// Host clock at capture, ISO-8601 local time with microseconds.
    pub timestamp: String,
    /// The parsed line.
    pub packet: CsiPacket,
}

impl CsiRecord {
    /// The row in [HEADER] order.
    pub fn to_row(&self) -> Vec<&str> {
        let mut row = Vec::with_capacity(HEADER.len());
        row.push(self.timestamp.as_str());
        row.extend(self.packet.fields.iter().map(String::as_str));
        row.push(self.packet.data.as_str());
        row
    }
}

/// The current host time in the timestamp format of session files.
pub fn host_timestamp() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}
