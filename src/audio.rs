// This file is part of tpsdvr, a TPS DVR web player.
// Copyright (C) 2026 The tpsdvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! G.711 μ-law decoding and WAV synthesis for the diagnostic audio endpoint.
//!
//! The live path forwards μ-law bytes untouched (the browser decodes them);
//! this module only serves `GET /api/v1/audio/{file_index}`, which returns a
//! playable mono 8 kHz 16-bit WAV for poking at recordings with ordinary
//! tools.

use byteorder::{LittleEndian, WriteBytesExt};

pub const SAMPLE_RATE: u32 = 8000;

/// μ-law byte → linear PCM, ITU-T G.711 expansion.
const ULAW_TABLE: [i16; 256] = build_ulaw_table();

const fn build_ulaw_table() -> [i16; 256] {
    let mut table = [0i16; 256];
    let mut i = 0usize;
    while i < 256 {
        let ulaw = !(i as u8);
        let sign = ulaw & 0x80 != 0;
        let exponent = (ulaw >> 4) & 0x07;
        let mantissa = ulaw & 0x0f;
        let mut sample = (((mantissa as i32) << 3) + 0x84) << exponent;
        sample -= 0x84;
        table[i] = if sign { -sample as i16 } else { sample as i16 };
        i += 1;
    }
    table
}

#[inline]
pub fn ulaw_decode(b: u8) -> i16 {
    ULAW_TABLE[b as usize]
}

/// Decodes μ-law bytes into little-endian 16-bit PCM.
pub fn decode_to_pcm(ulaw: &[u8]) -> Vec<u8> {
    let mut pcm = Vec::with_capacity(ulaw.len() * 2);
    for &b in ulaw {
        pcm.write_i16::<LittleEndian>(ulaw_decode(b))
            .expect("vec write is infallible");
    }
    pcm
}

/// Wraps PCM data in a minimal RIFF/WAVE header: mono, 8 kHz, 16-bit.
pub fn wav_from_pcm(pcm: &[u8]) -> Vec<u8> {
    let mut wav = Vec::with_capacity(44 + pcm.len());
    wav.extend_from_slice(b"RIFF");
    wav.write_u32::<LittleEndian>(36 + pcm.len() as u32).unwrap();
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.write_u32::<LittleEndian>(16).unwrap(); // fmt chunk size
    wav.write_u16::<LittleEndian>(1).unwrap(); // PCM
    wav.write_u16::<LittleEndian>(1).unwrap(); // mono
    wav.write_u32::<LittleEndian>(SAMPLE_RATE).unwrap();
    wav.write_u32::<LittleEndian>(SAMPLE_RATE * 2).unwrap(); // byte rate
    wav.write_u16::<LittleEndian>(2).unwrap(); // block align
    wav.write_u16::<LittleEndian>(16).unwrap(); // bits per sample
    wav.extend_from_slice(b"data");
    wav.write_u32::<LittleEndian>(pcm.len() as u32).unwrap();
    wav.extend_from_slice(pcm);
    wav
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ulaw_known_values() {
        // 0xff encodes zero (near-silence); 0x7f is its negative mirror.
        assert_eq!(ulaw_decode(0xff), 0);
        assert_eq!(ulaw_decode(0x7f), 0);
        // 0x00 / 0x80 are the extremes.
        assert_eq!(ulaw_decode(0x00), -32124);
        assert_eq!(ulaw_decode(0x80), 32124);
        // Decoding is odd-symmetric: flipping the sign bit negates.
        for b in 0u8..128 {
            assert_eq!(ulaw_decode(b), -ulaw_decode(b | 0x80), "byte {b:#x}");
        }
    }

    #[test]
    fn wav_shape() {
        let pcm = decode_to_pcm(&[0xffu8; 160]);
        assert_eq!(pcm.len(), 320);
        let wav = wav_from_pcm(&pcm);
        assert_eq!(wav.len(), 44 + 320);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(&wav[36..40], b"data");
        assert_eq!(
            u32::from_le_bytes(wav[40..44].try_into().unwrap()),
            320
        );
    }
}
