//! Codec wiring for the audio engine.
//!
//! The engine only knows the traits in `service::audio::codec`. The
//! default build drives them with the built-in PCM implementation; the
//! `opus` feature swaps in libopus through the `opus` crate, mapping the
//! control channel onto the encoder CTLs the binding exposes.

#[cfg(not(feature = "opus"))]
pub use service::audio::codec::PcmCodec as DefaultCodec;

#[cfg(feature = "opus")]
pub use self::opus_codec::OpusCodec as DefaultCodec;

#[cfg(feature = "opus")]
pub fn default_codec() -> DefaultCodec {
    DefaultCodec::default()
}

#[cfg(not(feature = "opus"))]
pub fn default_codec() -> DefaultCodec {
    DefaultCodec
}

#[cfg(feature = "opus")]
mod opus_codec {
    use service::audio::codec::{
        CodecApplication, CodecDecoder, CodecEncoder, CodecError, MediaCodec,
    };

    #[derive(Debug, Clone, Copy, Default)]
    pub struct OpusCodec;

    pub struct OpusEncoder {
        inner: opus::Encoder,
        bitrate: u32,
        dtx: bool,
        complexity: u8,
    }

    pub struct OpusDecoder {
        inner: opus::Decoder,
        frame_samples: usize,
    }

    fn channels(n: u8) -> Result<opus::Channels, CodecError> {
        match n {
            1 => Ok(opus::Channels::Mono),
            2 => Ok(opus::Channels::Stereo),
            _ => Err(CodecError::Unsupported),
        }
    }

    impl MediaCodec for OpusCodec {
        type Encoder = OpusEncoder;
        type Decoder = OpusDecoder;

        fn create_encoder(
            &self,
            sample_rate: u32,
            channels_n: u8,
            application: CodecApplication,
        ) -> Result<Self::Encoder, CodecError> {
            let application = match application {
                CodecApplication::Voip => opus::Application::Voip,
                CodecApplication::Audio => opus::Application::Audio,
                CodecApplication::LowDelay => opus::Application::LowDelay,
            };

            let inner = opus::Encoder::new(sample_rate, channels(channels_n)?, application)
                .map_err(|_| CodecError::CreateFailed)?;

            Ok(OpusEncoder {
                inner,
                bitrate: 64_000,
                dtx: false,
                complexity: 10,
            })
        }

        fn create_decoder(
            &self,
            sample_rate: u32,
            channels_n: u8,
        ) -> Result<Self::Decoder, CodecError> {
            Ok(OpusDecoder {
                inner: opus::Decoder::new(sample_rate, channels(channels_n)?)
                    .map_err(|_| CodecError::CreateFailed)?,
                frame_samples: (sample_rate / 50) as usize,
            })
        }
    }

    impl CodecEncoder for OpusEncoder {
        fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize, CodecError> {
            // DTX suppression for non-speech frames; the binding exposes
            // no DTX CTL, so frames are elided here instead.
            if self.dtx && pcm.iter().all(|&s| s == 0) {
                return Ok(0);
            }

            self.inner
                .encode(pcm, out)
                .map_err(|_| CodecError::EncodeFailed)
        }

        fn set_complexity(&mut self, complexity: u8) {
            self.complexity = complexity.min(10);
        }

        fn set_bitrate(&mut self, bitrate: u32) {
            if self
                .inner
                .set_bitrate(opus::Bitrate::Bits(bitrate as i32))
                .is_ok()
            {
                self.bitrate = bitrate;
            }
        }

        fn bitrate(&self) -> u32 {
            self.bitrate
        }

        fn set_inband_fec(&mut self, enabled: bool) {
            let _ = self.inner.set_inband_fec(enabled);
        }

        fn set_dtx(&mut self, enabled: bool) {
            self.dtx = enabled;
        }

        fn set_packet_loss_perc(&mut self, percent: u8) {
            let _ = self.inner.set_packet_loss_perc(percent as i32);
        }
    }

    impl CodecDecoder for OpusDecoder {
        fn decode(&mut self, packet: Option<&[u8]>, out: &mut [i16]) -> Result<usize, CodecError> {
            match packet {
                Some(bytes) => self
                    .inner
                    .decode(bytes, out, false)
                    .map_err(|_| CodecError::DecodeFailed),
                // An empty packet asks libopus for PLC synthesis.
                None => {
                    let wanted = self.frame_samples.min(out.len());
                    self.inner
                        .decode(&[], &mut out[..wanted], true)
                        .map_err(|_| CodecError::DecodeFailed)
                }
            }
        }
    }
}
