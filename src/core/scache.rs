//! The sample cache: named PCM blobs uploaded by clients and played as
//! short-lived sink inputs.

use crate::protocol::{ChannelMap, ChannelVolume, Props, SampleSpec};

use super::idxset::IdxSet;
use super::memchunk::MemChunk;

/// One cached sample.
pub struct CachedSample {
    /// The sample's stable index.
    pub index: u32,
    /// The name the sample was uploaded under.
    pub name: String,
    /// The sample's format.
    pub sample_spec: SampleSpec,
    /// The sample's channel map.
    pub channel_map: ChannelMap,
    /// The default volume to play at.
    pub cvolume: ChannelVolume,
    /// The PCM data.
    pub chunk: MemChunk,
    /// Additional metadata.
    pub props: Props,
}

impl CachedSample {
    /// The playback duration, in microseconds.
    pub fn duration_usec(&self) -> u64 {
        self.sample_spec.bytes_to_usec(self.chunk.length)
    }
}

/// The cache itself.
#[derive(Default)]
pub struct SampleCache {
    entries: IdxSet<CachedSample>,
}

impl SampleCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a sample, returning its index.
    pub fn add(
        &mut self,
        name: String,
        sample_spec: SampleSpec,
        channel_map: ChannelMap,
        cvolume: ChannelVolume,
        chunk: MemChunk,
        props: Props,
    ) -> u32 {
        self.entries.put_with(|index| CachedSample {
            index,
            name,
            sample_spec,
            channel_map,
            cvolume,
            chunk,
            props,
        })
    }

    /// Looks up a sample by index.
    pub fn get(&self, index: u32) -> Option<&CachedSample> {
        self.entries.get(index)
    }

    /// Looks up a sample by name.
    pub fn get_by_name(&self, name: &str) -> Option<&CachedSample> {
        self.entries.find(|s| s.name == name).map(|(_, s)| s)
    }

    /// Removes a sample by name, returning its index.
    pub fn remove_by_name(&mut self, name: &str) -> Option<u32> {
        let index = self.entries.find(|s| s.name == name).map(|(i, _)| i)?;
        self.entries.remove(index);
        Some(index)
    }

    /// Iterates over all cached samples.
    pub fn iter(&self) -> impl Iterator<Item = &CachedSample> {
        self.entries.iter().map(|(_, s)| s)
    }

    /// Total bytes held by the cache, reported by the `Stat` command.
    pub fn total_bytes(&self) -> usize {
        self.iter().map(|s| s.chunk.length).sum()
    }
}

#[cfg(test)]
mod tests {
    use crate::core::memblock::Mempool;

    use super::*;

    #[test]
    fn add_lookup_remove() {
        let pool = Mempool::new();
        let mut cache = SampleCache::new();

        let chunk = MemChunk::from_block(pool.adopt(vec![0; 1000]));
        let index = cache.add(
            "bell".into(),
            SampleSpec::default(),
            ChannelMap::stereo(),
            ChannelVolume::norm(2),
            chunk,
            Props::new(),
        );

        assert_eq!(cache.get_by_name("bell").unwrap().index, index);
        assert_eq!(cache.total_bytes(), 1000);

        assert_eq!(cache.remove_by_name("bell"), Some(index));
        assert!(cache.get_by_name("bell").is_none());
        assert_eq!(cache.total_bytes(), 0);
    }
}
