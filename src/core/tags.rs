//! Metadata tag reading for the `read-metadata` RPC (spec §6). Grounded on
//! the `lofty` `Probe::open().read()` idiom used for library metadata
//! elsewhere in the pack.

use std::path::Path;

use lofty::file::TaggedFileExt;
use lofty::prelude::Accessor;
use lofty::probe::Probe;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackMetadata {
    pub artist: Option<String>,
    pub title: Option<String>,
    pub album: Option<String>,
    pub track_no: Option<u32>,
}

/// Reads the primary (falling back to first) tag off an audio file. Returns
/// all-`None` fields rather than an error when the file has no tag at all;
/// only I/O/parse failures on the file itself propagate.
pub fn read_metadata(path: &Path) -> anyhow::Result<TrackMetadata> {
    let tagged_file = Probe::open(path)?.read()?;
    let tag = tagged_file.primary_tag().or_else(|| tagged_file.first_tag());

    let Some(tag) = tag else {
        return Ok(TrackMetadata::default());
    };

    Ok(TrackMetadata {
        artist: tag.artist().map(|s| s.to_string()),
        title: tag.title().map(|s| s.to_string()),
        album: tag.album().map(|s| s.to_string()),
        track_no: tag.track(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_an_error() {
        let result = read_metadata(Path::new("/nonexistent/track.mp3"));
        assert!(result.is_err());
    }
}
