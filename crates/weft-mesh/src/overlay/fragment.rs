//! IPv4 handling for frames that exceed the path MTU.
//!
//! Frames are complete Ethernet frames. Only untagged IPv4 is inspected;
//! everything else is forwarded as an opaque frame.

use crate::error::MeshError;

use super::frame::ETHERNET_OVERHEAD;

const ETHERTYPE_IPV4: u16 = 0x0800;
const IPV4_MIN_HEADER: usize = 20;
const FLAG_DF: u16 = 0x4000;
const FLAG_MF: u16 = 0x2000;
const OFFSET_MASK: u16 = 0x1fff;
const PROTO_ICMP: u8 = 1;
const ICMP_HEADER: usize = 8;
const ICMP_DEST_UNREACHABLE: u8 = 3;
const ICMP_FRAG_NEEDED: u8 = 4;
const DEFAULT_TTL: u8 = 64;

/// An IPv4 packet inside an Ethernet frame.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Frame<'a> {
    frame: &'a [u8],
    header_len: usize,
    total_len: usize,
}

impl<'a> Ipv4Frame<'a> {
    /// Parses `frame`, returning `None` unless it carries a well-formed
    /// IPv4 header.
    #[must_use]
    pub fn parse(frame: &'a [u8]) -> Option<Self> {
        if frame.len() < ETHERNET_OVERHEAD + IPV4_MIN_HEADER {
            return None;
        }
        if u16::from_be_bytes([frame[12], frame[13]]) != ETHERTYPE_IPV4 {
            return None;
        }
        let ip = &frame[ETHERNET_OVERHEAD..];
        if ip[0] >> 4 != 4 {
            return None;
        }
        let header_len = usize::from(ip[0] & 0x0f) * 4;
        let total_len = usize::from(u16::from_be_bytes([ip[2], ip[3]]));
        if header_len < IPV4_MIN_HEADER || total_len < header_len || total_len > ip.len() {
            return None;
        }
        Some(Self {
            frame,
            header_len,
            total_len,
        })
    }

    fn ip(&self) -> &'a [u8] {
        &self.frame[ETHERNET_OVERHEAD..ETHERNET_OVERHEAD + self.total_len]
    }

    fn flags_and_offset(&self) -> u16 {
        let ip = self.ip();
        u16::from_be_bytes([ip[6], ip[7]])
    }

    /// Returns true if the don't-fragment bit is set.
    #[must_use]
    pub fn dont_fragment(&self) -> bool {
        self.flags_and_offset() & FLAG_DF != 0
    }

    /// IP header length in bytes.
    #[must_use]
    pub const fn header_len(&self) -> usize {
        self.header_len
    }
}

/// Returns true if `frame` exceeds what an effective PMTU of `pmtu` carries.
#[must_use]
pub const fn frame_too_big(frame_len: usize, pmtu: usize) -> bool {
    frame_len > pmtu + ETHERNET_OVERHEAD
}

/// Splits `packet` into IPv4 fragments whose IP length is at most `pmtu`.
///
/// Fragments keep the original flags (including DF); all but the last have
/// more-fragments set. Offsets continue from the packet's own offset, so
/// fragments of fragments stay correct.
///
/// # Errors
///
/// Returns [`MeshError::Protocol`] if `pmtu` cannot hold the header plus
/// eight bytes of payload.
pub fn fragment(packet: &Ipv4Frame<'_>, pmtu: usize) -> Result<Vec<Vec<u8>>, MeshError> {
    let header_len = packet.header_len;
    let max_segment = pmtu.saturating_sub(header_len) & !7;
    if max_segment == 0 {
        return Err(MeshError::Protocol(format!(
            "PMTU {pmtu} too small to fragment a packet with a {header_len} byte header"
        )));
    }

    let eth = &packet.frame[..ETHERNET_OVERHEAD];
    let ip = packet.ip();
    let header = &ip[..header_len];
    let payload = &ip[header_len..];
    let orig = packet.flags_and_offset();
    let offset_base = usize::from(orig & OFFSET_MASK) << 3;
    let orig_flags = orig & !OFFSET_MASK;

    let mut fragments = Vec::with_capacity(payload.len().div_ceil(max_segment));
    for (i, segment) in payload.chunks(max_segment).enumerate() {
        let last = (i + 1) * max_segment >= payload.len();
        let flags = if last { orig_flags } else { orig_flags | FLAG_MF };
        let offset = ((i * max_segment + offset_base) >> 3) as u16 & OFFSET_MASK;

        let mut out = Vec::with_capacity(ETHERNET_OVERHEAD + header_len + segment.len());
        out.extend_from_slice(eth);
        out.extend_from_slice(header);
        out.extend_from_slice(segment);

        let hdr = &mut out[ETHERNET_OVERHEAD..ETHERNET_OVERHEAD + header_len];
        hdr[2..4].copy_from_slice(&((header_len + segment.len()) as u16).to_be_bytes());
        hdr[6..8].copy_from_slice(&(flags | offset).to_be_bytes());
        set_checksum(hdr, 10);
        fragments.push(out);
    }
    Ok(fragments)
}

/// Builds an ICMP "fragmentation needed" reply to `packet`, advertising
/// `pmtu` as the next-hop MTU. The reply travels back towards the sender,
/// so MAC and IP addresses are swapped. It does not set DF.
#[must_use]
pub fn icmp_frag_needed(packet: &Ipv4Frame<'_>, pmtu: usize) -> Vec<u8> {
    let eth = &packet.frame[..ETHERNET_OVERHEAD];
    let ip = packet.ip();
    // original header plus the first 8 bytes of its payload
    let quoted = &ip[..ip.len().min(packet.header_len + 8)];

    let icmp_len = ICMP_HEADER + quoted.len();
    let ip_len = IPV4_MIN_HEADER + icmp_len;
    let mut out = vec![0u8; ETHERNET_OVERHEAD + ip_len];

    out[0..6].copy_from_slice(&eth[6..12]);
    out[6..12].copy_from_slice(&eth[0..6]);
    out[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

    let hdr = &mut out[ETHERNET_OVERHEAD..ETHERNET_OVERHEAD + IPV4_MIN_HEADER];
    hdr[0] = 0x45;
    hdr[2..4].copy_from_slice(&(ip_len as u16).to_be_bytes());
    hdr[8] = DEFAULT_TTL;
    hdr[9] = PROTO_ICMP;
    hdr[12..16].copy_from_slice(&ip[16..20]);
    hdr[16..20].copy_from_slice(&ip[12..16]);
    set_checksum(hdr, 10);

    let icmp = &mut out[ETHERNET_OVERHEAD + IPV4_MIN_HEADER..];
    icmp[0] = ICMP_DEST_UNREACHABLE;
    icmp[1] = ICMP_FRAG_NEEDED;
    icmp[6..8].copy_from_slice(&(pmtu.min(usize::from(u16::MAX)) as u16).to_be_bytes());
    icmp[ICMP_HEADER..].copy_from_slice(quoted);
    set_checksum(icmp, 2);
    out
}

/// Internet checksum (RFC 1071).
fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| u32::from(u16::from_be_bytes([pair[0], *pair.get(1).unwrap_or(&0)])))
        .sum();
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn set_checksum(data: &mut [u8], at: usize) {
    data[at..at + 2].copy_from_slice(&[0, 0]);
    let sum = checksum(data);
    data[at..at + 2].copy_from_slice(&sum.to_be_bytes());
}
