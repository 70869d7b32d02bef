//! LC3 Codec Capabilities, Configurations and Presets
//!
//! Capability and configuration records travel as opaque LTV (length, type, value)
//! blobs. This module keeps them bounded, reads the few fields the orchestration layer
//! needs (sample rate, frame duration, octets per frame) and picks the best LC3 preset
//! a remote capability can carry.

use crate::constants::MAX_CODEC_DATA;
use crate::qos::{Framing, Phy, QosConfig};
use crate::{AudioError, AudioLocation};
use heapless::Vec;

/// LTV types found in a codec capability record
pub mod cap_type {
    /// Supported sampling frequencies (`u16` bitfield)
    pub const FREQ: u8 = 0x01;
    /// Supported frame durations
    pub const DURATION: u8 = 0x02;
    /// Supported audio channel counts
    pub const CHAN_COUNT: u8 = 0x03;
    /// Octets per codec frame, minimum then maximum (`u16` each)
    pub const FRAME_LEN: u8 = 0x04;
    /// Maximum codec frames per SDU
    pub const FRAME_COUNT: u8 = 0x05;
}

/// LTV types found in a codec configuration record
pub mod cfg_type {
    /// Sampling frequency code
    pub const FREQ: u8 = 0x01;
    /// Frame duration code
    pub const DURATION: u8 = 0x02;
    /// Audio channel allocation (`u32`)
    pub const CHAN_ALLOC: u8 = 0x03;
    /// Octets per codec frame (`u16`)
    pub const FRAME_LEN: u8 = 0x04;
    /// Codec frame blocks per SDU
    pub const FRAME_BLKS_PER_SDU: u8 = 0x05;
}

/// Sampling frequency support advertised in a capability record (bitfield)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SupportedFrequencies(pub u16);

impl SupportedFrequencies {
    /// 8000 Hz
    pub const HZ_8000: u16 = 1 << 0;
    /// 11025 Hz
    pub const HZ_11025: u16 = 1 << 1;
    /// 16000 Hz
    pub const HZ_16000: u16 = 1 << 2;
    /// 22050 Hz
    pub const HZ_22050: u16 = 1 << 3;
    /// 24000 Hz
    pub const HZ_24000: u16 = 1 << 4;
    /// 32000 Hz
    pub const HZ_32000: u16 = 1 << 5;
    /// 44100 Hz
    pub const HZ_44100: u16 = 1 << 6;
    /// 48000 Hz
    pub const HZ_48000: u16 = 1 << 7;

    /// Check if frequency is supported
    #[must_use]
    pub const fn supports(&self, freq: u16) -> bool {
        (self.0 & freq) != 0
    }

    /// Bit for a sample rate in Hz, if LC3 defines one
    #[must_use]
    pub const fn bit_for_hz(hz: u32) -> Option<u16> {
        match hz {
            8_000 => Some(Self::HZ_8000),
            11_025 => Some(Self::HZ_11025),
            16_000 => Some(Self::HZ_16000),
            22_050 => Some(Self::HZ_22050),
            24_000 => Some(Self::HZ_24000),
            32_000 => Some(Self::HZ_32000),
            44_100 => Some(Self::HZ_44100),
            48_000 => Some(Self::HZ_48000),
            _ => None,
        }
    }
}

/// Sampling frequency codes used in configuration records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SamplingFrequency {
    /// 8000 Hz
    Hz8000 = 0x01,
    /// 11025 Hz
    Hz11025 = 0x02,
    /// 16000 Hz
    Hz16000 = 0x03,
    /// 22050 Hz
    Hz22050 = 0x04,
    /// 24000 Hz
    Hz24000 = 0x05,
    /// 32000 Hz
    Hz32000 = 0x06,
    /// 44100 Hz
    Hz44100 = 0x07,
    /// 48000 Hz
    Hz48000 = 0x08,
}

impl SamplingFrequency {
    /// Sample rate in Hz
    #[must_use]
    pub const fn hz(self) -> u32 {
        match self {
            Self::Hz8000 => 8_000,
            Self::Hz11025 => 11_025,
            Self::Hz16000 => 16_000,
            Self::Hz22050 => 22_050,
            Self::Hz24000 => 24_000,
            Self::Hz32000 => 32_000,
            Self::Hz44100 => 44_100,
            Self::Hz48000 => 48_000,
        }
    }

    /// Decode a configuration frequency code
    ///
    /// # Errors
    /// Returns `AudioError::Unsupported` for reserved codes.
    pub const fn from_code(code: u8) -> Result<Self, AudioError> {
        match code {
            0x01 => Ok(Self::Hz8000),
            0x02 => Ok(Self::Hz11025),
            0x03 => Ok(Self::Hz16000),
            0x04 => Ok(Self::Hz22050),
            0x05 => Ok(Self::Hz24000),
            0x06 => Ok(Self::Hz32000),
            0x07 => Ok(Self::Hz44100),
            0x08 => Ok(Self::Hz48000),
            _ => Err(AudioError::Unsupported),
        }
    }
}

/// LC3 frame duration codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum FrameDuration {
    /// 7.5 ms
    Ms7_5 = 0x00,
    /// 10 ms
    Ms10 = 0x01,
}

impl FrameDuration {
    /// Duration in microseconds
    #[must_use]
    pub const fn us(self) -> u32 {
        match self {
            Self::Ms7_5 => 7_500,
            Self::Ms10 => 10_000,
        }
    }
}

/// Find the value of the first LTV entry of type `ty`.
///
/// Zero-length entries are skipped; a truncated entry ends the walk.
fn ltv_find(data: &[u8], ty: u8) -> Option<&[u8]> {
    let mut i = 0;
    while i < data.len() {
        let len = data[i] as usize;
        if len == 0 {
            i += 1;
            continue;
        }
        let end = i + 1 + len;
        if end > data.len() {
            return None;
        }
        if data[i + 1] == ty {
            return Some(&data[i + 2..end]);
        }
        i = end;
    }
    None
}

fn le16(value: &[u8], offset: usize) -> Option<u16> {
    let bytes = value.get(offset..offset + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// A remote codec capability record (one PAC record's codec-specific capabilities)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CodecCapability {
    data: Vec<u8, MAX_CODEC_DATA>,
}

impl CodecCapability {
    /// Copy a capability LTV blob
    ///
    /// # Errors
    /// Returns `AudioError::InvalidArgument` if the blob is longer than `MAX_CODEC_DATA`.
    pub fn from_ltv(data: &[u8]) -> Result<Self, AudioError> {
        Ok(Self {
            data: Vec::from_slice(data).map_err(|()| AudioError::InvalidArgument)?,
        })
    }

    /// Raw LTV bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Supported sampling frequencies, if present
    #[must_use]
    pub fn supported_frequencies(&self) -> Option<SupportedFrequencies> {
        ltv_find(&self.data, cap_type::FREQ)
            .and_then(|v| le16(v, 0))
            .map(SupportedFrequencies)
    }

    /// Allowed octets per frame as `(min, max)`, if present
    #[must_use]
    pub fn octets_per_frame_range(&self) -> Option<(u16, u16)> {
        let value = ltv_find(&self.data, cap_type::FRAME_LEN)?;
        Some((le16(value, 0)?, le16(value, 2)?))
    }
}

/// A configured codec: the LTV configuration blob plus the channel allocation
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CodecConfig {
    data: Vec<u8, MAX_CODEC_DATA>,
    /// Audio locations carried by this stream
    pub allocation: AudioLocation,
}

impl CodecConfig {
    /// Copy a configuration LTV blob
    ///
    /// # Errors
    /// Returns `AudioError::InvalidArgument` if the blob is longer than `MAX_CODEC_DATA`.
    pub fn from_ltv(data: &[u8]) -> Result<Self, AudioError> {
        let data = Vec::from_slice(data).map_err(|()| AudioError::InvalidArgument)?;
        let allocation = ltv_find(&data, cfg_type::CHAN_ALLOC)
            .and_then(|v| v.get(..4))
            .map_or(AudioLocation::MONO_AUDIO, |v| {
                AudioLocation(u32::from_le_bytes([v[0], v[1], v[2], v[3]]))
            });
        Ok(Self { data, allocation })
    }

    /// Build an LC3 configuration
    #[must_use]
    pub fn lc3(freq: SamplingFrequency, duration: FrameDuration, octets_per_frame: u16) -> Self {
        let octets = octets_per_frame.to_le_bytes();
        let mut data = Vec::new();
        // Fits: 3 + 3 + 4 bytes
        data.extend_from_slice(&[
            0x02,
            cfg_type::FREQ,
            freq as u8,
            0x02,
            cfg_type::DURATION,
            duration as u8,
            0x03,
            cfg_type::FRAME_LEN,
            octets[0],
            octets[1],
        ])
        .ok();
        Self {
            data,
            allocation: AudioLocation::MONO_AUDIO,
        }
    }

    /// Set the channel allocation
    #[must_use]
    pub fn with_allocation(mut self, allocation: AudioLocation) -> Self {
        self.allocation = allocation;
        self
    }

    /// Raw LTV bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Sample rate in Hz
    ///
    /// # Errors
    /// `AudioError::NotFound` if the record has no frequency entry,
    /// `AudioError::Unsupported` for a reserved frequency code.
    pub fn sample_rate_hz(&self) -> Result<u32, AudioError> {
        let value = ltv_find(&self.data, cfg_type::FREQ).ok_or(AudioError::NotFound)?;
        let code = *value.first().ok_or(AudioError::Corruption)?;
        Ok(SamplingFrequency::from_code(code)?.hz())
    }

    /// Frame duration in microseconds
    ///
    /// # Errors
    /// `AudioError::NotFound` if the record has no duration entry,
    /// `AudioError::Unsupported` for a reserved duration code.
    pub fn frame_duration_us(&self) -> Result<u32, AudioError> {
        let value = ltv_find(&self.data, cfg_type::DURATION).ok_or(AudioError::NotFound)?;
        match value.first() {
            Some(0x00) => Ok(FrameDuration::Ms7_5.us()),
            Some(0x01) => Ok(FrameDuration::Ms10.us()),
            Some(_) => Err(AudioError::Unsupported),
            None => Err(AudioError::Corruption),
        }
    }

    /// Octets per codec frame
    ///
    /// # Errors
    /// `AudioError::NotFound` if the record has no frame length entry.
    pub fn octets_per_frame(&self) -> Result<u16, AudioError> {
        let value = ltv_find(&self.data, cfg_type::FRAME_LEN).ok_or(AudioError::NotFound)?;
        le16(value, 0).ok_or(AudioError::Corruption)
    }

    /// Overwrite the octets per frame entry in place
    ///
    /// # Errors
    /// `AudioError::NotFound` if the record has no frame length entry.
    pub fn set_octets_per_frame(&mut self, octets: u16) -> Result<(), AudioError> {
        let mut i = 0;
        while i < self.data.len() {
            let len = self.data[i] as usize;
            if len == 0 {
                i += 1;
                continue;
            }
            let end = i + 1 + len;
            if end > self.data.len() {
                break;
            }
            if self.data[i + 1] == cfg_type::FRAME_LEN && len >= 3 {
                self.data[i + 2..i + 4].copy_from_slice(&octets.to_le_bytes());
                return Ok(());
            }
            i = end;
        }
        Err(AudioError::NotFound)
    }

    /// Bitrate in bits per second: octets * 8 * 1e6 / frame duration
    ///
    /// # Errors
    /// Propagates the accessor errors of the underlying entries.
    pub fn bitrate(&self) -> Result<u32, AudioError> {
        let octets = u64::from(self.octets_per_frame()?);
        let duration = u64::from(self.frame_duration_us()?);
        if duration == 0 {
            return Err(AudioError::InvalidArgument);
        }
        u32::try_from(octets * 8 * 1_000_000 / duration).map_err(|_| AudioError::InvalidArgument)
    }
}

/// A codec configuration together with the QoS it is streamed with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preset {
    /// Codec configuration
    pub codec: CodecConfig,
    /// QoS configuration
    pub qos: QosConfig,
}

impl Preset {
    const fn qos(sdu: u16, rtn: u8, latency_ms: u16) -> QosConfig {
        QosConfig {
            interval_us: 10_000,
            framing: Framing::Unframed,
            phy: Phy::Le2M,
            sdu,
            rtn,
            max_transport_latency_ms: latency_ms,
            presentation_delay_us: 40_000,
        }
    }

    /// LC3 16 kHz, 10 ms, 40 octets per frame, low latency
    #[must_use]
    pub fn lc3_16_2_1() -> Self {
        Self {
            codec: CodecConfig::lc3(SamplingFrequency::Hz16000, FrameDuration::Ms10, 40),
            qos: Self::qos(40, 2, 10),
        }
    }

    /// LC3 24 kHz, 10 ms, 60 octets per frame, low latency
    #[must_use]
    pub fn lc3_24_2_1() -> Self {
        Self {
            codec: CodecConfig::lc3(SamplingFrequency::Hz24000, FrameDuration::Ms10, 60),
            qos: Self::qos(60, 2, 10),
        }
    }

    /// LC3 48 kHz, 10 ms, 120 octets per frame, high reliability
    #[must_use]
    pub fn lc3_48_4_1() -> Self {
        Self {
            codec: CodecConfig::lc3(SamplingFrequency::Hz48000, FrameDuration::Ms10, 120),
            qos: Self::qos(120, 5, 20),
        }
    }

    /// Pick the preset a capability record can carry.
    ///
    /// The preferred sample rate wins when supported (48 kHz then runs with two
    /// retransmissions to keep latency down). Otherwise the highest supported of
    /// 48/24/16 kHz is used. Octets per frame outside the advertised range are clamped
    /// to the maximum.
    ///
    /// # Errors
    /// `AudioError::Unsupported` if none of the preset rates is supported,
    /// `AudioError::InvalidArgument` if the capability carries no frequency entry.
    pub fn for_capability(cap: &CodecCapability, preferred_hz: u32) -> Result<Self, AudioError> {
        let freqs = cap.supported_frequencies().ok_or(AudioError::InvalidArgument)?;

        let preferred = SupportedFrequencies::bit_for_hz(preferred_hz)
            .filter(|bit| freqs.supports(*bit))
            .and_then(|bit| match bit {
                SupportedFrequencies::HZ_48000 => {
                    let mut preset = Self::lc3_48_4_1();
                    preset.qos.rtn = 2;
                    Some(preset)
                }
                SupportedFrequencies::HZ_24000 => Some(Self::lc3_24_2_1()),
                SupportedFrequencies::HZ_16000 => Some(Self::lc3_16_2_1()),
                _ => None,
            });

        let mut preset = match preferred {
            Some(preset) => preset,
            None if freqs.supports(SupportedFrequencies::HZ_48000) => Self::lc3_48_4_1(),
            None if freqs.supports(SupportedFrequencies::HZ_24000) => Self::lc3_24_2_1(),
            None if freqs.supports(SupportedFrequencies::HZ_16000) => Self::lc3_16_2_1(),
            None => {
                debug!("[CODEC] No supported sample rate found");
                return Err(AudioError::Unsupported);
            }
        };

        if let Some((min, max)) = cap.octets_per_frame_range() {
            let octets = preset.codec.octets_per_frame()?;
            if !(min..=max).contains(&octets) {
                debug!(
                    "[CODEC] Preset octets/frame {} not in range [{}, {}]",
                    octets,
                    min,
                    max
                );
                preset.codec.set_octets_per_frame(max)?;
                preset.qos.sdu = max;
            }
        }

        Ok(preset)
    }

    /// Whether `self` should replace `current` as a direction's preset.
    ///
    /// A preset at the preferred rate beats one that is not; otherwise a higher or equal
    /// rate with at least as many octets per frame wins.
    #[must_use]
    pub fn is_better_than(&self, current: Option<&Preset>, preferred_hz: u32) -> bool {
        let Some(current) = current else {
            return true;
        };
        let (Ok(new_rate), Ok(cur_rate)) = (self.codec.sample_rate_hz(), current.codec.sample_rate_hz())
        else {
            return false;
        };

        if (new_rate >= cur_rate && cur_rate != preferred_hz) || new_rate == preferred_hz {
            if new_rate == preferred_hz && cur_rate != preferred_hz {
                return true;
            }
            let new_octets = self.codec.octets_per_frame().unwrap_or(0);
            let cur_octets = current.codec.octets_per_frame().unwrap_or(0);
            return new_octets >= cur_octets;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capability(freqs: u16, min: u16, max: u16) -> CodecCapability {
        let f = freqs.to_le_bytes();
        let lo = min.to_le_bytes();
        let hi = max.to_le_bytes();
        CodecCapability::from_ltv(&[
            0x03,
            cap_type::FREQ,
            f[0],
            f[1],
            0x02,
            cap_type::DURATION,
            0x02,
            0x05,
            cap_type::FRAME_LEN,
            lo[0],
            lo[1],
            hi[0],
            hi[1],
        ])
        .unwrap()
    }

    #[test]
    fn test_codec_config_accessors() {
        let cfg = CodecConfig::lc3(SamplingFrequency::Hz48000, FrameDuration::Ms10, 120);
        assert_eq!(cfg.sample_rate_hz(), Ok(48_000));
        assert_eq!(cfg.frame_duration_us(), Ok(10_000));
        assert_eq!(cfg.octets_per_frame(), Ok(120));
        assert_eq!(cfg.bitrate(), Ok(96_000));

        let cfg = CodecConfig::lc3(SamplingFrequency::Hz16000, FrameDuration::Ms7_5, 30);
        assert_eq!(cfg.bitrate(), Ok(32_000));
    }

    #[test]
    fn test_codec_config_from_ltv_reads_allocation() {
        let cfg = CodecConfig::from_ltv(&[
            0x02,
            cfg_type::FREQ,
            0x05,
            0x05,
            cfg_type::CHAN_ALLOC,
            0x02,
            0x00,
            0x00,
            0x00,
        ])
        .unwrap();
        assert_eq!(cfg.allocation, AudioLocation::FRONT_RIGHT);
        assert_eq!(cfg.sample_rate_hz(), Ok(24_000));
        assert_eq!(cfg.octets_per_frame(), Err(AudioError::NotFound));
    }

    #[test]
    fn test_codec_blob_too_long() {
        let data = [0u8; MAX_CODEC_DATA + 1];
        assert_eq!(
            CodecCapability::from_ltv(&data),
            Err(AudioError::InvalidArgument)
        );
        assert_eq!(CodecConfig::from_ltv(&data), Err(AudioError::InvalidArgument));
    }

    #[test]
    fn test_truncated_ltv_is_ignored() {
        let cap = CodecCapability::from_ltv(&[0x05, cap_type::FREQ, 0x80]).unwrap();
        assert_eq!(cap.supported_frequencies(), None);
    }

    #[test]
    fn test_capability_accessors() {
        let cap = capability(SupportedFrequencies::HZ_16000 | SupportedFrequencies::HZ_48000, 30, 155);
        let freqs = cap.supported_frequencies().unwrap();
        assert!(freqs.supports(SupportedFrequencies::HZ_48000));
        assert!(!freqs.supports(SupportedFrequencies::HZ_24000));
        assert_eq!(cap.octets_per_frame_range(), Some((30, 155)));
    }

    #[test]
    fn test_preset_prefers_configured_rate() {
        let cap = capability(
            SupportedFrequencies::HZ_16000
                | SupportedFrequencies::HZ_24000
                | SupportedFrequencies::HZ_48000,
            26,
            155,
        );
        let preset = Preset::for_capability(&cap, 24_000).unwrap();
        assert_eq!(preset.codec.sample_rate_hz(), Ok(24_000));

        let preset = Preset::for_capability(&cap, 48_000).unwrap();
        assert_eq!(preset.codec.sample_rate_hz(), Ok(48_000));
        assert_eq!(preset.qos.rtn, 2);
        assert_eq!(preset.qos.max_transport_latency_ms, 20);
    }

    #[test]
    fn test_preset_falls_back_to_highest_rate() {
        let cap = capability(
            SupportedFrequencies::HZ_16000 | SupportedFrequencies::HZ_24000,
            26,
            155,
        );
        let preset = Preset::for_capability(&cap, 48_000).unwrap();
        assert_eq!(preset.codec.sample_rate_hz(), Ok(24_000));

        let cap = capability(SupportedFrequencies::HZ_8000, 26, 155);
        assert_eq!(
            Preset::for_capability(&cap, 48_000),
            Err(AudioError::Unsupported)
        );
    }

    #[test]
    fn test_preset_clamps_octets_to_capability() {
        let cap = capability(SupportedFrequencies::HZ_48000, 40, 100);
        let preset = Preset::for_capability(&cap, 48_000).unwrap();
        assert_eq!(preset.codec.octets_per_frame(), Ok(100));
        assert_eq!(preset.qos.sdu, 100);
    }

    #[test]
    fn test_preset_ranking() {
        let p16 = Preset::lc3_16_2_1();
        let p24 = Preset::lc3_24_2_1();
        let p48 = Preset::lc3_48_4_1();

        assert!(p16.is_better_than(None, 48_000));
        // Preferred rate wins over a higher one
        assert!(p24.is_better_than(Some(&p48), 24_000));
        assert!(!p48.is_better_than(Some(&p24), 24_000));
        // Without a preferred match the higher rate wins
        assert!(p48.is_better_than(Some(&p16), 24_000));
        assert!(!p16.is_better_than(Some(&p48), 24_000));

        let mut small48 = Preset::lc3_48_4_1();
        small48.codec.set_octets_per_frame(80).unwrap();
        assert!(!small48.is_better_than(Some(&p48), 48_000));
        assert!(p48.is_better_than(Some(&small48), 48_000));
    }
}
