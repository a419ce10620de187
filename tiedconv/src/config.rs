use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::LayerError;

/// Position of the channel axis in a 4D image tensor.
///
/// Serialized in snake case; deserialized through [`FromStr`], so any casing is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum DataFormat {
    /// `(batch, channels, height, width)`
    ChannelsFirst,
    /// `(batch, height, width, channels)`
    ChannelsLast,
}

impl DataFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChannelsFirst => "channels_first",
            Self::ChannelsLast => "channels_last",
        }
    }

    /// Index of the channel axis in a rank-4 shape.
    pub fn channel_axis(&self) -> usize {
        match self {
            Self::ChannelsFirst => 1,
            Self::ChannelsLast => 3,
        }
    }

    /// Indices of the (height, width) axes in a rank-4 shape.
    pub fn spatial_axes(&self) -> (usize, usize) {
        match self {
            Self::ChannelsFirst => (2, 3),
            Self::ChannelsLast => (1, 2),
        }
    }
}

impl std::fmt::Display for DataFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataFormat {
    type Err = LayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "channels_first" => Ok(Self::ChannelsFirst),
            "channels_last" => Ok(Self::ChannelsLast),
            other => Err(LayerError::InvalidConfig(format!(
                "data_format must be `channels_first` or `channels_last`, got `{other}`"
            ))),
        }
    }
}

impl TryFrom<String> for DataFormat {
    type Error = LayerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Boundary handling of the convolution the layer inverts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum PaddingMode {
    Valid,
    Same,
}

impl PaddingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Same => "same",
        }
    }
}

impl std::fmt::Display for PaddingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaddingMode {
    type Err = LayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "valid" => Ok(Self::Valid),
            "same" => Ok(Self::Same),
            other => Err(LayerError::InvalidConfig(format!(
                "padding must be `valid` or `same`, got `{other}`"
            ))),
        }
    }
}

impl TryFrom<String> for PaddingMode {
    type Error = LayerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// Process-wide default used when a layer leaves `data_format` unset.
static IMAGE_DATA_FORMAT: AtomicU8 = AtomicU8::new(DATA_FORMAT_LAST);

const DATA_FORMAT_LAST: u8 = 0;
const DATA_FORMAT_FIRST: u8 = 1;

/// Current process-wide channel ordering (`channels_last` unless changed).
pub fn image_data_format() -> DataFormat {
    match IMAGE_DATA_FORMAT.load(Ordering::Relaxed) {
        DATA_FORMAT_FIRST => DataFormat::ChannelsFirst,
        _ => DataFormat::ChannelsLast,
    }
}

/// Change the process-wide channel ordering picked up by layers built afterwards.
pub fn set_image_data_format(format: DataFormat) {
    let raw = match format {
        DataFormat::ChannelsFirst => DATA_FORMAT_FIRST,
        DataFormat::ChannelsLast => DATA_FORMAT_LAST,
    };
    IMAGE_DATA_FORMAT.store(raw, Ordering::Relaxed);
}

/// Compute backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum DeviceKind {
    Cpu,
    Gpu,
}

/// Serializes tests that touch the process-wide default.
#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Mutex, MutexGuard, PoisonError};

    use super::{image_data_format, set_image_data_format, DataFormat};

    static DEFAULT_FORMAT_LOCK: Mutex<()> = Mutex::new(());

    /// Holds the default at `format` until dropped, then restores the previous value.
    pub(crate) struct DefaultFormatGuard {
        previous: DataFormat,
        _lock: MutexGuard<'static, ()>,
    }

    pub(crate) fn default_data_format(format: DataFormat) -> DefaultFormatGuard {
        let lock = DEFAULT_FORMAT_LOCK
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let previous = image_data_format();
        set_image_data_format(format);
        DefaultFormatGuard {
            previous,
            _lock: lock,
        }
    }

    impl Drop for DefaultFormatGuard {
        fn drop(&mut self) {
            set_image_data_format(self.previous);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_format_parses_case_insensitively() {
        assert_eq!(
            "Channels_First".parse::<DataFormat>().unwrap(),
            DataFormat::ChannelsFirst
        );
        assert_eq!(
            "CHANNELS_LAST".parse::<DataFormat>().unwrap(),
            DataFormat::ChannelsLast
        );
        assert!("nchw".parse::<DataFormat>().is_err());
    }

    #[test]
    fn padding_parses_case_insensitively() {
        assert_eq!("SAME".parse::<PaddingMode>().unwrap(), PaddingMode::Same);
        assert_eq!("valid".parse::<PaddingMode>().unwrap(), PaddingMode::Valid);
        let err = "full".parse::<PaddingMode>().unwrap_err();
        assert!(matches!(err, LayerError::InvalidConfig(_)));
    }

    #[test]
    fn axes_follow_channel_ordering() {
        assert_eq!(DataFormat::ChannelsFirst.channel_axis(), 1);
        assert_eq!(DataFormat::ChannelsLast.channel_axis(), 3);
        assert_eq!(DataFormat::ChannelsFirst.spatial_axes(), (2, 3));
        assert_eq!(DataFormat::ChannelsLast.spatial_axes(), (1, 2));
    }

    #[test]
    fn serde_uses_snake_case_names() {
        let json = serde_json::to_string(&DataFormat::ChannelsFirst).unwrap();
        assert_eq!(json, "\"channels_first\"");
        let padding: PaddingMode = serde_json::from_str("\"same\"").unwrap();
        assert_eq!(padding, PaddingMode::Same);
    }

    #[test]
    fn deserialization_ignores_case() {
        let format: DataFormat = serde_json::from_str("\"Channels_First\"").unwrap();
        assert_eq!(format, DataFormat::ChannelsFirst);
        let padding: PaddingMode = serde_json::from_str("\"VALID\"").unwrap();
        assert_eq!(padding, PaddingMode::Valid);

        let err = serde_json::from_str::<PaddingMode>("\"full\"").unwrap_err();
        assert!(err.to_string().contains("`valid` or `same`"));
    }
}
