//! Per-song training store: one flat array per quantity plus a JSON manifest of song ranges.
//!
//! Array files hold little-endian values whatever the host byte order:
//! `features.f32` (`frame × time × freq × channel`), `labels.i8` (onset flag, `-1` when
//! the song lacks the difficulty) and `onehot.u8` (`frame × combination`).

use ndarray::{Array2, Array4};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::arrows::NUM_COMBINATIONS;
use crate::chart::align::FrameAlignedLabelSet;
use crate::error::{Result, StepError};

const MANIFEST_FILE: &str = "manifest.json";
const FEATURES_FILE: &str = "features.f32";
const LABELS_FILE: &str = "labels.i8";
const ONEHOT_FILE: &str = "onehot.u8";

/// Marks every frame of a song that has no chart for the stored difficulty.
pub const MISSING_LABEL: i8 = -1;

/// Half-open frame range `[start, end)` of one song in the global arrays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SongRange {
    pub start: usize,
    pub end: usize,
}

impl SongRange {
    pub fn len(&self) -> usize {
        self.end - self.start
    }
}

/// Read access to an opened corpus. Reads are per song so memory stays bounded.
pub trait DatasetStore {
    fn song_ranges(&self) -> &[SongRange];

    fn song_range(&self, index: usize) -> Result<SongRange> {
        self.song_ranges().get(index).copied().ok_or_else(|| {
            StepError::Dataset(format!(
                "song index {} is out of range ({} songs)",
                index,
                self.song_ranges().len()
            ))
        })
    }

    /// `[time bands, freq bands, channels]` of one feature frame.
    fn frame_shape(&self) -> [usize; 3];

    fn labels(&mut self, range: SongRange) -> Result<Vec<i8>>;

    fn features(&mut self, range: SongRange) -> Result<Array4<f32>>;

    fn onehot_arrows(&mut self, range: SongRange) -> Result<Array2<u8>>;
}

/// Opens a [`DatasetStore`]. The store is the acquisition guard: dropping it releases it.
pub trait DatasetSource {
    type Store: DatasetStore;

    fn open(&self) -> Result<Self::Store>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SongEntry {
    pub name: String,
    pub range: SongRange,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CorpusManifest {
    pub difficulty: String,
    pub frame_shape: [usize; 3],
    pub songs: Vec<SongEntry>,
}

impl CorpusManifest {
    pub fn total_frames(&self) -> usize {
        self.songs.last().map_or(0, |song| song.range.end)
    }

    fn frame_len(&self) -> usize {
        self.frame_shape.iter().product()
    }
}

/// Appends songs to a corpus directory. The manifest is written by [`CorpusWriter::finish`].
pub struct CorpusWriter {
    dir: PathBuf,
    manifest: CorpusManifest,
    features: BufWriter<File>,
    labels: BufWriter<File>,
    onehot: BufWriter<File>,
}

impl CorpusWriter {
    pub fn create(dir: &Path, difficulty: &str, frame_shape: [usize; 3]) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let open = |name: &str| -> Result<BufWriter<File>> {
            Ok(BufWriter::new(File::create(dir.join(name))?))
        };
        Ok(Self {
            dir: dir.to_path_buf(),
            manifest: CorpusManifest {
                difficulty: difficulty.to_string(),
                frame_shape,
                songs: Vec::new(),
            },
            features: open(FEATURES_FILE)?,
            labels: open(LABELS_FILE)?,
            onehot: open(ONEHOT_FILE)?,
        })
    }

    /// Append one song. `labels` is `None` when the song has no chart for this difficulty.
    pub fn append_song(
        &mut self,
        name: &str,
        features: &Array4<f32>,
        labels: Option<&FrameAlignedLabelSet>,
    ) -> Result<SongRange> {
        let (frames, time, freq, channels) = features.dim();
        if [time, freq, channels] != self.manifest.frame_shape {
            return Err(StepError::Dataset(format!(
                "song '{}' has frame shape {:?}, corpus expects {:?}",
                name,
                [time, freq, channels],
                self.manifest.frame_shape
            )));
        }
        if let Some(labels) = labels {
            if labels.len() != frames {
                return Err(StepError::Dataset(format!(
                    "song '{}' has {} label frames for {} feature frames",
                    name,
                    labels.len(),
                    frames
                )));
            }
        }

        let values: Vec<u32> = features.iter().map(|v| v.to_bits().to_le()).collect();
        self.features.write_all(bytemuck::cast_slice(&values))?;

        match labels {
            Some(labels) => {
                let onsets: Vec<i8> = labels.onsets.iter().copied().collect();
                self.labels.write_all(bytemuck::cast_slice(&onsets))?;
                let onehot: Vec<u8> = labels.onehot.iter().copied().collect();
                self.onehot.write_all(&onehot)?;
            }
            None => {
                self.labels.write_all(bytemuck::cast_slice(&vec![MISSING_LABEL; frames]))?;
                self.onehot.write_all(&vec![0u8; frames * NUM_COMBINATIONS])?;
            }
        }

        let start = self.manifest.total_frames();
        let range = SongRange {
            start,
            end: start + frames,
        };
        self.manifest.songs.push(SongEntry {
            name: name.to_string(),
            range,
        });
        Ok(range)
    }

    pub fn finish(mut self) -> Result<CorpusManifest> {
        self.features.flush()?;
        self.labels.flush()?;
        self.onehot.flush()?;
        let manifest_file = File::create(self.dir.join(MANIFEST_FILE))?;
        serde_json::to_writer_pretty(BufWriter::new(manifest_file), &self.manifest)?;
        log::info!(
            "Wrote corpus with {} songs ({} frames) to {}",
            self.manifest.songs.len(),
            self.manifest.total_frames(),
            self.dir.display()
        );
        Ok(self.manifest)
    }
}

/// A corpus directory on disk.
#[derive(Clone, Debug)]
pub struct FileCorpus {
    dir: PathBuf,
}

impl FileCorpus {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn manifest(&self) -> Result<CorpusManifest> {
        let path = self.dir.join(MANIFEST_FILE);
        let file = File::open(&path).map_err(|e| {
            StepError::Dataset(format!("cannot open manifest {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }
}

impl DatasetSource for FileCorpus {
    type Store = CorpusReader;

    fn open(&self) -> Result<CorpusReader> {
        let manifest = self.manifest()?;
        let open = |name: &str| -> Result<File> {
            let path = self.dir.join(name);
            File::open(&path)
                .map_err(|e| StepError::Dataset(format!("cannot open {}: {}", path.display(), e)))
        };
        let ranges = manifest.songs.iter().map(|song| song.range).collect();
        log::debug!("Opened corpus {}", self.dir.display());
        Ok(CorpusReader {
            dir: self.dir.clone(),
            features: open(FEATURES_FILE)?,
            labels: open(LABELS_FILE)?,
            onehot: open(ONEHOT_FILE)?,
            ranges,
            manifest,
        })
    }
}

/// Open handles on a [`FileCorpus`]; released when dropped.
pub struct CorpusReader {
    dir: PathBuf,
    manifest: CorpusManifest,
    ranges: Vec<SongRange>,
    features: File,
    labels: File,
    onehot: File,
}

impl CorpusReader {
    pub fn manifest(&self) -> &CorpusManifest {
        &self.manifest
    }

    fn check(&self, range: SongRange) -> Result<()> {
        if range.start > range.end || range.end > self.manifest.total_frames() {
            return Err(StepError::Dataset(format!(
                "range {}..{} is outside the corpus ({} frames)",
                range.start,
                range.end,
                self.manifest.total_frames()
            )));
        }
        Ok(())
    }
}

fn read_at<T: bytemuck::Pod + Default>(file: &mut File, offset: usize, count: usize) -> Result<Vec<T>> {
    let mut values = vec![T::default(); count];
    file.seek(SeekFrom::Start((offset * std::mem::size_of::<T>()) as u64))?;
    file.read_exact(bytemuck::cast_slice_mut(&mut values))?;
    Ok(values)
}

impl DatasetStore for CorpusReader {
    fn song_ranges(&self) -> &[SongRange] {
        &self.ranges
    }

    fn frame_shape(&self) -> [usize; 3] {
        self.manifest.frame_shape
    }

    fn labels(&mut self, range: SongRange) -> Result<Vec<i8>> {
        self.check(range)?;
        read_at(&mut self.labels, range.start, range.len())
    }

    fn features(&mut self, range: SongRange) -> Result<Array4<f32>> {
        self.check(range)?;
        let frame_len = self.manifest.frame_len();
        let values: Vec<f32> =
            read_at::<u32>(&mut self.features, range.start * frame_len, range.len() * frame_len)?
                .into_iter()
                .map(|bits| f32::from_bits(u32::from_le(bits)))
                .collect();
        let [time, freq, channels] = self.manifest.frame_shape;
        Array4::from_shape_vec((range.len(), time, freq, channels), values)
            .map_err(|e| StepError::Dataset(e.to_string()))
    }

    fn onehot_arrows(&mut self, range: SongRange) -> Result<Array2<u8>> {
        self.check(range)?;
        let values = read_at::<u8>(
            &mut self.onehot,
            range.start * NUM_COMBINATIONS,
            range.len() * NUM_COMBINATIONS,
        )?;
        Array2::from_shape_vec((range.len(), NUM_COMBINATIONS), values)
            .map_err(|e| StepError::Dataset(e.to_string()))
    }
}

impl Drop for CorpusReader {
    fn drop(&mut self) {
        log::debug!("Released corpus {}", self.dir.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arrows::encoding::ArrowVocabulary;
    use crate::chart::timing::NoteTimingEvent;
    use crate::chart::align::TemporalAligner;
    use crate::config::CollisionPolicy;

    fn features(frames: usize, offset: f32) -> Array4<f32> {
        Array4::from_shape_fn((frames, 2, 3, 1), |(n, t, f, _)| offset + (n * 100 + t * 10 + f) as f32)
    }

    fn labels(frames: usize, onset_at: usize) -> FrameAlignedLabelSet {
        let event = NoteTimingEvent {
            time_secs: onset_at as f64 * 0.01,
            arrows: ArrowVocabulary.encode("1001").unwrap(),
        };
        TemporalAligner::new(0.01, CollisionPolicy::LastWins)
            .align_events("hard", &[event], frames)
            .unwrap()
    }

    #[test]
    fn round_trips_songs_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = CorpusWriter::create(dir.path(), "hard", [2, 3, 1]).unwrap();
        let first = writer.append_song("a", &features(4, 0.0), Some(&labels(4, 1))).unwrap();
        let second = writer.append_song("b", &features(3, 0.5), None).unwrap();
        let manifest = writer.finish().unwrap();

        assert_eq!(first, SongRange { start: 0, end: 4 });
        assert_eq!(second, SongRange { start: 4, end: 7 });
        assert_eq!(manifest.total_frames(), 7);

        let corpus = FileCorpus::new(dir.path());
        let mut store = corpus.open().unwrap();
        assert_eq!(store.song_ranges(), &[first, second]);
        assert_eq!(store.frame_shape(), [2, 3, 1]);

        assert_eq!(store.labels(first).unwrap(), vec![0, 1, 0, 0]);
        assert_eq!(store.labels(second).unwrap(), vec![MISSING_LABEL; 3]);
        assert_eq!(store.features(second).unwrap(), features(3, 0.5));

        let onehot = store.onehot_arrows(first).unwrap();
        assert_eq!(onehot.dim(), (4, NUM_COMBINATIONS));
        assert_eq!(onehot[[0, 0]], 1);
        assert_eq!(onehot[[1, 65]], 1);
        assert_eq!(store.onehot_arrows(second).unwrap().sum(), 0);
    }

    #[test]
    fn features_are_stored_little_endian() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = CorpusWriter::create(dir.path(), "hard", [1, 2, 1]).unwrap();
        let song = Array4::from_shape_vec((1, 1, 2, 1), vec![1.5f32, -0.25]).unwrap();
        writer.append_song("a", &song, None).unwrap();
        writer.finish().unwrap();

        let bytes = std::fs::read(dir.path().join(FEATURES_FILE)).unwrap();
        let expected: Vec<u8> = [1.5f32, -0.25].iter().flat_map(|v| v.to_le_bytes()).collect();
        assert_eq!(bytes, expected);
        assert_eq!(std::fs::read(dir.path().join(LABELS_FILE)).unwrap(), vec![0xff]);

        let mut store = FileCorpus::new(dir.path()).open().unwrap();
        assert_eq!(store.features(SongRange { start: 0, end: 1 }).unwrap(), song);
        assert_eq!(store.manifest().difficulty, "hard");
    }

    #[test]
    fn rejects_mismatched_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = CorpusWriter::create(dir.path(), "hard", [2, 3, 1]).unwrap();
        let wrong = Array4::<f32>::zeros((4, 2, 4, 1));
        assert!(writer.append_song("x", &wrong, None).is_err());
        assert!(writer.append_song("y", &features(4, 0.0), Some(&labels(5, 1))).is_err());
    }

    #[test]
    fn out_of_range_reads_fail() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = CorpusWriter::create(dir.path(), "hard", [2, 3, 1]).unwrap();
        writer.append_song("a", &features(2, 0.0), None).unwrap();
        writer.finish().unwrap();
        let mut store = FileCorpus::new(dir.path()).open().unwrap();
        assert!(store.labels(SongRange { start: 1, end: 5 }).is_err());
    }

    #[test]
    fn missing_corpus_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            FileCorpus::new(dir.path().join("nothing")).open(),
            Err(StepError::Dataset(_))
        ));
    }
}
