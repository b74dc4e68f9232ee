//! Payload kinds and decoding
//!
//! Every request carries a [`PayloadKind`] that decides how fetched bytes
//! are turned into a [`Payload`]. Image and audio decoding goes through a
//! [`MediaDecoder`] so hosts can plug in their own codecs; the default
//! [`StandardDecoder`] uses `image` for pictures and `hound` for WAV audio.

use std::io::Cursor;

use crate::error::DecodeError;

/// Kind of payload a request produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    /// Raw bytes
    Bytes,
    /// UTF-8 text
    Text,
    /// Decoded RGBA8 image
    Image,
    /// Decoded PCM audio
    Audio,
    /// LZ4-compressed bundle
    Archive,
}

impl PayloadKind {
    /// Whether a cached copy is loaded with a direct file read (disk budget)
    /// rather than through the transport's media path (network budget)
    pub fn reads_directly(self) -> bool {
        match self {
            Self::Bytes | Self::Text | Self::Archive => true,
            Self::Image | Self::Audio => false,
        }
    }

    /// Decode raw bytes into a payload of this kind
    pub fn decode(self, data: Vec<u8>, decoder: &dyn MediaDecoder) -> Result<Payload, DecodeError> {
        match self {
            Self::Bytes => Ok(Payload::Bytes(data)),
            Self::Text => String::from_utf8(data)
                .map(Payload::Text)
                .map_err(|e| DecodeError::new(self, format!("Invalid UTF-8: {}", e))),
            Self::Image => decoder.decode_image(&data).map(Payload::Image),
            Self::Audio => decoder.decode_audio(&data).map(Payload::Audio),
            Self::Archive => Archive::decode(&data).map(Payload::Archive),
        }
    }
}

/// Decoded RGBA8 image
#[derive(Clone, PartialEq, Eq)]
pub struct ImageData {
    pub width: u32,
    pub height: u32,
    /// Tightly packed RGBA8 pixels, row-major
    pub pixels: Vec<u8>,
}

impl ImageData {
    /// Bytes per row (width * 4)
    pub fn bytes_per_row(&self) -> u32 {
        self.width * 4
    }

    /// Encode as PNG
    pub fn encode_png(&self) -> Result<Vec<u8>, DecodeError> {
        let buffer = image::RgbaImage::from_raw(self.width, self.height, self.pixels.clone())
            .ok_or_else(|| DecodeError::new(PayloadKind::Image, "pixel buffer does not match dimensions"))?;

        let mut out = Cursor::new(Vec::new());
        buffer
            .write_to(&mut out, image::ImageFormat::Png)
            .map_err(|e| DecodeError::new(PayloadKind::Image, format!("PNG encode failed: {}", e)))?;
        Ok(out.into_inner())
    }
}

impl std::fmt::Debug for ImageData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageData")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

/// Decoded PCM audio, samples interleaved and normalised to [-1, 1]
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    pub channels: u16,
    pub sample_rate: u32,
    pub samples: Vec<f32>,
}

impl AudioClip {
    /// Number of frames (samples per channel)
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    /// Duration in seconds
    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f32 / self.sample_rate as f32
    }
}

/// Decompressed bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archive {
    /// Decompressed contents
    pub data: Vec<u8>,
    /// Size of the compressed bundle
    pub packed_len: usize,
}

impl Archive {
    /// Pack bytes into the bundle format (size-prefixed LZ4 block)
    pub fn pack(data: &[u8]) -> Vec<u8> {
        lz4_flex::compress_prepend_size(data)
    }

    /// Unpack a bundle
    pub fn decode(packed: &[u8]) -> Result<Self, DecodeError> {
        let data = lz4_flex::decompress_size_prepended(packed)
            .map_err(|e| DecodeError::new(PayloadKind::Archive, e.to_string()))?;
        Ok(Self {
            data,
            packed_len: packed.len(),
        })
    }
}

/// A decoded payload
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Bytes(Vec<u8>),
    Text(String),
    Image(ImageData),
    Audio(AudioClip),
    Archive(Archive),
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Bytes(_) => PayloadKind::Bytes,
            Self::Text(_) => PayloadKind::Text,
            Self::Image(_) => PayloadKind::Image,
            Self::Audio(_) => PayloadKind::Audio,
            Self::Archive(_) => PayloadKind::Archive,
        }
    }

    /// Typed view of the payload, `None` when the kind does not match
    pub fn get<T: PayloadType + ?Sized>(&self) -> Option<&T> {
        let value = T::from_payload(self);
        if value.is_none() {
            log::warn!("Invalid cast: {:?} payload requested as {:?}", self.kind(), T::KIND);
        }
        value
    }
}

/// Rust types a payload can be viewed as
pub trait PayloadType {
    /// Kind of request that produces this type
    const KIND: PayloadKind;

    fn from_payload(payload: &Payload) -> Option<&Self>;
}

impl PayloadType for [u8] {
    const KIND: PayloadKind = PayloadKind::Bytes;

    fn from_payload(payload: &Payload) -> Option<&Self> {
        match payload {
            Payload::Bytes(data) => Some(data),
            _ => None,
        }
    }
}

impl PayloadType for str {
    const KIND: PayloadKind = PayloadKind::Text;

    fn from_payload(payload: &Payload) -> Option<&Self> {
        match payload {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl PayloadType for ImageData {
    const KIND: PayloadKind = PayloadKind::Image;

    fn from_payload(payload: &Payload) -> Option<&Self> {
        match payload {
            Payload::Image(image) => Some(image),
            _ => None,
        }
    }
}

impl PayloadType for AudioClip {
    const KIND: PayloadKind = PayloadKind::Audio;

    fn from_payload(payload: &Payload) -> Option<&Self> {
        match payload {
            Payload::Audio(clip) => Some(clip),
            _ => None,
        }
    }
}

impl PayloadType for Archive {
    const KIND: PayloadKind = PayloadKind::Archive;

    fn from_payload(payload: &Payload) -> Option<&Self> {
        match payload {
            Payload::Archive(archive) => Some(archive),
            _ => None,
        }
    }
}

/// Codec capability for media payloads
pub trait MediaDecoder {
    fn decode_image(&self, data: &[u8]) -> Result<ImageData, DecodeError>;

    fn decode_audio(&self, data: &[u8]) -> Result<AudioClip, DecodeError>;
}

/// Default codecs: PNG/JPEG/BMP/HDR images, WAV audio
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardDecoder;

impl MediaDecoder for StandardDecoder {
    fn decode_image(&self, data: &[u8]) -> Result<ImageData, DecodeError> {
        let img = image::load_from_memory(data)
            .map_err(|e| DecodeError::new(PayloadKind::Image, e.to_string()))?;

        let rgba = img.to_rgba8();
        let (width, height) = rgba.dimensions();

        Ok(ImageData {
            width,
            height,
            pixels: rgba.into_raw(),
        })
    }

    fn decode_audio(&self, data: &[u8]) -> Result<AudioClip, DecodeError> {
        let err = |e: hound::Error| DecodeError::new(PayloadKind::Audio, e.to_string());

        let reader = hound::WavReader::new(Cursor::new(data)).map_err(err)?;
        let spec = reader.spec();

        let samples = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<Result<Vec<_>, _>>()
                .map_err(err)?,
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(err)?
            }
        };

        Ok(AudioClip {
            channels: spec.channels,
            sample_rate: spec.sample_rate,
            samples,
        })
    }
}
