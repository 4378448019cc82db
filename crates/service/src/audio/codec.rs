//! Voice-codec contract.
//!
//! The monitor treats the lossy codec as a black box behind these traits:
//! an encoder/decoder factory plus a control channel for complexity, target
//! bitrate, inband FEC, DTX and the expected loss percentage. Frames are
//! 20 ms of mono PCM (`sample_rate / 50` samples); decoding accepts `None`
//! to ask the codec to synthesize a frame from its own FEC/PLC state.
//!
//! [`PcmCodec`] is the built-in implementation: uncompressed 16-bit PCM
//! with the control channel tracked but inert. It keeps the whole engine
//! exercisable without a native codec library; the binary swaps in an Opus
//! adapter when built with the `opus` feature.

#[derive(Debug, PartialEq, Eq)]
pub enum CodecError {
    CreateFailed,
    EncodeFailed,
    DecodeFailed,
    /// The configuration asks for something the codec cannot do
    /// (sample rate, channel count).
    Unsupported,
}

impl std::error::Error for CodecError {}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Encoder tuning profile, mirroring the application modes voice codecs
/// commonly expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum CodecApplication {
    #[default]
    Voip,
    Audio,
    LowDelay,
}

pub trait MediaCodec: Send {
    type Encoder: CodecEncoder;
    type Decoder: CodecDecoder;

    fn create_encoder(
        &self,
        sample_rate: u32,
        channels: u8,
        application: CodecApplication,
    ) -> Result<Self::Encoder, CodecError>;

    fn create_decoder(&self, sample_rate: u32, channels: u8) -> Result<Self::Decoder, CodecError>;
}

pub trait CodecEncoder: Send {
    /// Encodes one frame of PCM. Returns the number of bytes written into
    /// `out`.
    fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize, CodecError>;

    fn set_complexity(&mut self, complexity: u8);

    /// Target bitrate in bits per second.
    fn set_bitrate(&mut self, bitrate: u32);

    fn bitrate(&self) -> u32;

    fn set_inband_fec(&mut self, enabled: bool);

    fn set_dtx(&mut self, enabled: bool);

    /// Expected packet-loss percentage, steering how much redundancy the
    /// encoder spends.
    fn set_packet_loss_perc(&mut self, percent: u8);
}

pub trait CodecDecoder: Send {
    /// Decodes one packet into `out`, or synthesizes a concealment frame
    /// when `packet` is `None`. Returns the number of samples written.
    fn decode(&mut self, packet: Option<&[u8]>, out: &mut [i16]) -> Result<usize, CodecError>;
}

/// Pass-through 16-bit PCM codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct PcmCodec;

pub struct PcmEncoder {
    bitrate: u32,
    complexity: u8,
    inband_fec: bool,
    dtx: bool,
    packet_loss_perc: u8,
}

pub struct PcmDecoder;

impl MediaCodec for PcmCodec {
    type Encoder = PcmEncoder;
    type Decoder = PcmDecoder;

    fn create_encoder(
        &self,
        sample_rate: u32,
        channels: u8,
        _application: CodecApplication,
    ) -> Result<Self::Encoder, CodecError> {
        if sample_rate == 0 || channels != 1 {
            return Err(CodecError::Unsupported);
        }

        Ok(PcmEncoder {
            bitrate: sample_rate * 16,
            complexity: 0,
            inband_fec: false,
            dtx: false,
            packet_loss_perc: 0,
        })
    }

    fn create_decoder(&self, sample_rate: u32, channels: u8) -> Result<Self::Decoder, CodecError> {
        if sample_rate == 0 || channels != 1 {
            return Err(CodecError::Unsupported);
        }

        Ok(PcmDecoder)
    }
}

impl CodecEncoder for PcmEncoder {
    fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize, CodecError> {
        if out.len() < pcm.len() * 2 {
            return Err(CodecError::EncodeFailed);
        }

        for (sample, chunk) in pcm.iter().zip(out.chunks_exact_mut(2)) {
            chunk.copy_from_slice(&sample.to_le_bytes());
        }

        Ok(pcm.len() * 2)
    }

    fn set_complexity(&mut self, complexity: u8) {
        self.complexity = complexity;
    }

    fn set_bitrate(&mut self, bitrate: u32) {
        self.bitrate = bitrate;
    }

    fn bitrate(&self) -> u32 {
        self.bitrate
    }

    fn set_inband_fec(&mut self, enabled: bool) {
        self.inband_fec = enabled;
    }

    fn set_dtx(&mut self, enabled: bool) {
        self.dtx = enabled;
    }

    fn set_packet_loss_perc(&mut self, percent: u8) {
        self.packet_loss_perc = percent;
    }
}

impl CodecDecoder for PcmDecoder {
    fn decode(&mut self, packet: Option<&[u8]>, out: &mut [i16]) -> Result<usize, CodecError> {
        let Some(packet) = packet else {
            // PCM has no FEC state of its own; concealment is silence.
            out.fill(0);
            return Ok(out.len());
        };

        let samples = packet.len() / 2;
        if out.len() < samples {
            return Err(CodecError::DecodeFailed);
        }

        for (chunk, sample) in packet.chunks_exact(2).zip(out.iter_mut()) {
            *sample = i16::from_le_bytes([chunk[0], chunk[1]]);
        }

        Ok(samples)
    }
}
