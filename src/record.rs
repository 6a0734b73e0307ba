//! Packet records and the record builder
//!
//! A [`PacketRecord`] is the structured, immutable form of one IPv4 packet.
//! Records are numbered by a stream-wide sequence and stamped with the running
//! total of inter-arrival gaps, both kept in [`StreamCounters`].

use std::fmt::{self, Write as _};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::packet::{DecodedPacket, TransportHeader};

/// Header line of every shard file and of the merged file
pub const CSV_HEADER: &str = "No.,Time,Source,Destination,Protocol,Length,Info\n";

/// Typical serialized line length, used to size line buffers
const LINE_CAPACITY: usize = 128;

/// Transport protocol of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Protocol {
    Icmp,
    Tcp,
    Udp,
    Unknown,
}

impl Protocol {
    /// Get the name written in the Protocol column
    pub fn name(&self) -> &'static str {
        match self {
            Self::Icmp => "ICMP",
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One captured packet in structured form
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PacketRecord {
    /// Stream-wide sequence number, starting at 1
    pub sequence: u64,
    /// Running total of inter-arrival gaps in milliseconds
    pub elapsed_millis: u64,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub protocol: Protocol,
    /// IPv4 total length
    pub length: u16,
    /// Protocol-specific detail, empty for `Unknown`
    pub info: String,
}

impl PacketRecord {
    /// Append the CSV line for this record, newline included
    pub fn write_csv_line(&self, out: &mut String) {
        // Writing into a String cannot fail
        let _ = writeln!(
            out,
            "{},{},{},{},{},{},{}",
            self.sequence,
            self.elapsed_millis,
            self.source,
            self.destination,
            self.protocol,
            self.length,
            self.info
        );
    }

    /// Serialize this record into a fresh CSV line
    pub fn to_csv_line(&self) -> String {
        let mut line = String::with_capacity(LINE_CAPACITY);
        self.write_csv_line(&mut line);
        line
    }
}

/// Stream-wide counters shared by every producer thread
///
/// Only increment-and-get and get-and-set style operations are exposed.
#[derive(Debug)]
pub struct StreamCounters {
    /// Last assigned sequence number
    sequence: AtomicU64,
    /// Accumulated inter-arrival time in milliseconds
    elapsed_millis: AtomicU64,
    /// Latest arrival seen, in nanoseconds since `origin`
    last_arrival_nanos: AtomicU64,
    /// Reference point for arrival timestamps
    origin: Instant,
}

impl Default for StreamCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamCounters {
    /// Create counters whose clock starts now
    pub fn new() -> Self {
        Self::with_origin(Instant::now())
    }

    /// Create counters whose clock starts at `origin`
    pub fn with_origin(origin: Instant) -> Self {
        Self {
            sequence: AtomicU64::new(0),
            elapsed_millis: AtomicU64::new(0),
            last_arrival_nanos: AtomicU64::new(0),
            origin,
        }
    }

    /// Assign the next sequence number
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Get the last assigned sequence number
    pub fn current_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Advance the elapsed-time accumulator to `arrival` and return the new total
    ///
    /// The gap is measured against the latest arrival seen so far, so an
    /// arrival that is older than one already recorded contributes nothing.
    pub fn advance_clock(&self, arrival: Instant) -> u64 {
        let now = arrival.saturating_duration_since(self.origin).as_nanos() as u64;
        let previous = self.last_arrival_nanos.fetch_max(now, Ordering::AcqRel);
        let gap_millis = now.saturating_sub(previous) / 1_000_000;

        self.elapsed_millis.fetch_add(gap_millis, Ordering::AcqRel) + gap_millis
    }

    /// Get the accumulated elapsed time in milliseconds
    pub fn elapsed_millis(&self) -> u64 {
        self.elapsed_millis.load(Ordering::Acquire)
    }
}

/// Turns decoded packets into records
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    counters: Arc<StreamCounters>,
}

impl RecordBuilder {
    /// Create a builder over the given counters
    pub fn new(counters: Arc<StreamCounters>) -> Self {
        Self { counters }
    }

    /// Get the counters this builder advances
    pub fn counters(&self) -> &Arc<StreamCounters> {
        &self.counters
    }

    /// Build the record for `packet`, or `None` if it is not IPv4
    pub fn build(&self, packet: &DecodedPacket) -> Option<PacketRecord> {
        if !packet.is_ipv4() {
            return None;
        }
        let ipv4 = packet.ipv4.as_ref()?;

        let sequence = self.counters.next_sequence();
        let elapsed_millis = self.counters.advance_clock(packet.arrival);
        let (protocol, info) = classify(ipv4.transport.as_ref());

        Some(PacketRecord {
            sequence,
            elapsed_millis,
            source: ipv4.source,
            destination: ipv4.destination,
            protocol,
            length: ipv4.total_length,
            info,
        })
    }
}

fn classify(transport: Option<&TransportHeader>) -> (Protocol, String) {
    let mut info = String::new();
    let protocol = match transport {
        Some(TransportHeader::Icmp { icmp_type, code }) => {
            let _ = write!(info, "Type:{},Code:{}", icmp_type, code);
            Protocol::Icmp
        }
        Some(TransportHeader::Tcp { source_port, destination_port }) => {
            let _ = write!(info, "SrcPort:{},DstPort:{}", source_port, destination_port);
            Protocol::Tcp
        }
        Some(TransportHeader::Udp { source_port, destination_port }) => {
            let _ = write!(info, "SrcPort:{},DstPort:{}", source_port, destination_port);
            Protocol::Udp
        }
        None => Protocol::Unknown,
    };

    (protocol, info)
}
