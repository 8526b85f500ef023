// This file is part of tpsdvr, a TPS DVR web player.
// Copyright (C) 2026 The tpsdvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! H.265 Annex-B helpers.
//!
//! tpsdvr does not decode video. It only needs to find NAL unit boundaries in
//! the container's byte stream, classify each unit by type, and locate the
//! VPS/SPS/PPS/IDR prologue a decoder requires before the first predicted
//! frame. NAL payloads are forwarded to the browser as-is.

use memchr::memmem;

pub const NAL_TRAIL_N: u8 = 0;
pub const NAL_TRAIL_R: u8 = 1;
pub const NAL_IDR_W_RADL: u8 = 19;
pub const NAL_IDR_N_LP: u8 = 20;
pub const NAL_VPS: u8 = 32;
pub const NAL_SPS: u8 = 33;
pub const NAL_PPS: u8 = 34;

/// Extracts the NAL unit type from the first payload byte after a start code.
#[inline]
pub fn nal_type(first_payload_byte: u8) -> u8 {
    (first_payload_byte >> 1) & 0x3f
}

/// True for the frame types this device emits: trailing pictures and IDRs.
#[inline]
pub fn is_video_frame(t: u8) -> bool {
    matches!(t, NAL_TRAIL_N | NAL_TRAIL_R | NAL_IDR_W_RADL | NAL_IDR_N_LP)
}

#[inline]
pub fn is_key_frame(t: u8) -> bool {
    matches!(t, NAL_IDR_W_RADL | NAL_IDR_N_LP)
}

#[inline]
pub fn is_parameter_set(t: u8) -> bool {
    matches!(t, NAL_VPS | NAL_SPS | NAL_PPS)
}

/// One NAL unit located within a scanned buffer, start code included.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NalUnit {
    /// Offset of the start code within the buffer.
    pub offset: usize,
    /// Length including the start code.
    pub len: usize,
    pub nal_type: u8,
}

impl NalUnit {
    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// Strips a leading `00 00 00 01` or `00 00 01` start code.
pub fn strip_start_code(data: &[u8]) -> &[u8] {
    if let Some(rest) = data.strip_prefix(&[0, 0, 0, 1]) {
        return rest;
    }
    if let Some(rest) = data.strip_prefix(&[0, 0, 1]) {
        return rest;
    }
    data
}

/// Finds every NAL unit in `data`.
///
/// Both start code forms are recognized; `00 00 00 01` wins when a zero byte
/// precedes a three-byte code. Each unit extends to the next start code, and
/// the final unit extends to the end of the buffer (it may be truncated; the
/// stream reader keeps it buffered until the next refill).
pub fn parse_nal_units(data: &[u8]) -> Vec<NalUnit> {
    let mut starts: Vec<(usize, usize)> = Vec::new(); // (code offset, payload offset)
    let mut pos = 0;
    let finder = memmem::Finder::new(&[0u8, 0, 1]);
    while let Some(i) = finder.find(&data[pos..]) {
        let i = pos + i;
        let code_start = if i > 0 && data[i - 1] == 0 { i - 1 } else { i };
        starts.push((code_start, i + 3));
        pos = i + 3;
    }

    let mut units = Vec::with_capacity(starts.len());
    for (n, &(code_start, payload_start)) in starts.iter().enumerate() {
        if payload_start >= data.len() {
            break; // start code at the very end; no type byte yet.
        }
        let end = starts.get(n + 1).map(|&(c, _)| c).unwrap_or(data.len());
        units.push(NalUnit {
            offset: code_start,
            len: end - code_start,
            nal_type: nal_type(data[payload_start]),
        });
    }
    units
}

/// The decoder prologue extracted near an I-frame position.
#[derive(Clone, Debug)]
pub struct VideoHeader {
    /// NAL payloads without start codes.
    pub vps: Vec<u8>,
    pub sps: Vec<u8>,
    pub pps: Vec<u8>,
    pub idr: Vec<u8>,
    /// Offset within the scanned buffer just past the IDR, where the
    /// subsequent predicted-frame scan resumes.
    pub resume_offset: usize,
}

/// Returns the first VPS/SPS/PPS in order followed by the first subsequent
/// IDR, or `None` if any of the four is missing before the buffer ends.
pub fn extract_video_header(data: &[u8]) -> Option<VideoHeader> {
    let units = parse_nal_units(data);
    let vps_idx = units.iter().position(|u| u.nal_type == NAL_VPS)?;

    let mut vps = None;
    let mut sps = None;
    let mut pps = None;
    for u in &units[vps_idx..] {
        let payload = strip_start_code(&data[u.offset..u.end()]);
        match u.nal_type {
            NAL_VPS => {
                vps.get_or_insert_with(|| payload.to_vec());
            }
            NAL_SPS => {
                sps.get_or_insert_with(|| payload.to_vec());
            }
            NAL_PPS => {
                pps.get_or_insert_with(|| payload.to_vec());
            }
            NAL_IDR_W_RADL | NAL_IDR_N_LP => {
                return Some(VideoHeader {
                    vps: vps?,
                    sps: sps?,
                    pps: pps?,
                    idr: payload.to_vec(),
                    resume_offset: u.end(),
                });
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nal(t: u8, payload: &[u8]) -> Vec<u8> {
        let mut v = vec![0, 0, 0, 1, t << 1, 0x01];
        v.extend_from_slice(payload);
        v
    }

    #[test]
    fn classify() {
        assert_eq!(nal_type(0x40), NAL_VPS);
        assert_eq!(nal_type(0x42), NAL_SPS);
        assert_eq!(nal_type(0x44), NAL_PPS);
        assert_eq!(nal_type(0x26), NAL_IDR_W_RADL);
        assert!(is_key_frame(NAL_IDR_N_LP));
        assert!(is_video_frame(NAL_TRAIL_R));
        assert!(!is_video_frame(NAL_SPS));
        assert!(is_parameter_set(NAL_PPS));
    }

    #[test]
    fn parse_mixed_start_codes() {
        let mut data = nal(NAL_VPS, &[0xaa; 4]);
        // Three-byte start code in the middle.
        data.extend_from_slice(&[0, 0, 1, NAL_TRAIL_R << 1, 0x01, 0xbb, 0xbb]);
        data.extend_from_slice(&nal(NAL_TRAIL_N, &[0xcc; 8]));
        let units = parse_nal_units(&data);
        assert_eq!(units.len(), 3);
        assert_eq!(units[0].nal_type, NAL_VPS);
        assert_eq!(units[0].offset, 0);
        assert_eq!(units[1].nal_type, NAL_TRAIL_R);
        assert_eq!(units[2].nal_type, NAL_TRAIL_N);
        assert_eq!(units[2].end(), data.len());
    }

    #[test]
    fn strip() {
        assert_eq!(strip_start_code(&[0, 0, 0, 1, 0x40, 9]), &[0x40, 9][..]);
        assert_eq!(strip_start_code(&[0, 0, 1, 0x40]), &[0x40][..]);
        assert_eq!(strip_start_code(&[0x40, 9]), &[0x40, 9][..]);
    }

    #[test]
    fn extract_header() {
        let mut data = Vec::new();
        data.extend_from_slice(&nal(NAL_VPS, &[1]));
        data.extend_from_slice(&nal(NAL_SPS, &[2, 2]));
        data.extend_from_slice(&nal(NAL_PPS, &[3]));
        data.extend_from_slice(&nal(NAL_IDR_W_RADL, &[4; 16]));
        let idr_end = data.len();
        data.extend_from_slice(&nal(NAL_TRAIL_R, &[5; 8]));

        let h = extract_video_header(&data).unwrap();
        assert_eq!(h.vps, &[NAL_VPS << 1, 0x01, 1]);
        assert_eq!(h.sps, &[NAL_SPS << 1, 0x01, 2, 2]);
        assert_eq!(h.pps, &[NAL_PPS << 1, 0x01, 3]);
        assert_eq!(h.idr.len(), 2 + 16);
        assert_eq!(h.resume_offset, idr_end);
    }

    #[test]
    fn extract_header_requires_idr() {
        let mut data = Vec::new();
        data.extend_from_slice(&nal(NAL_VPS, &[1]));
        data.extend_from_slice(&nal(NAL_SPS, &[2]));
        data.extend_from_slice(&nal(NAL_PPS, &[3]));
        data.extend_from_slice(&nal(NAL_TRAIL_R, &[5; 8]));
        assert!(extract_video_header(&data).is_none());
    }

    #[test]
    fn extract_header_requires_vps_first() {
        let data = nal(NAL_IDR_W_RADL, &[4; 16]);
        assert!(extract_video_header(&data).is_none());
    }
}
