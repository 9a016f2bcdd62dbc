use crate::{DaqError, DaqResult, EventBuffer, OutputSink};
use crossbeam_channel::Sender;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// 'VMED'
pub const RUN_FILE_MAGIC: u32 = 0x564D_4544;
pub const RUN_FILE_VERSION: u32 = 1;
pub const RUN_HEADER_WORDS: usize = 5;

/// Appends event words to a run file.
///
/// Words are staged in memory and written out, little-endian, once
/// `buffer_capacity` words are pending or on `flush`.
pub struct RunWriter {
    path: PathBuf,
    file: BufWriter<File>,
    buffer: Vec<u32>,
    pub buffer_capacity: usize,
    pub words_written: usize,
    pub buffers_written: usize,
}

impl RunWriter {
    pub fn create(
        path: &Path,
        run_number: u32,
        start_time: u64,
        buffer_capacity: usize,
    ) -> DaqResult<Self> {
        let file = BufWriter::new(File::create(path)?);
        let mut writer = Self {
            path: path.to_path_buf(),
            file,
            buffer: Vec::with_capacity(buffer_capacity),
            buffer_capacity: buffer_capacity.max(1),
            words_written: 0,
            buffers_written: 0,
        };
        writer.write_words(&[
            RUN_FILE_MAGIC,
            RUN_FILE_VERSION,
            run_number,
            start_time as u32,
            (start_time >> 32) as u32,
        ])?;
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stage one buffer, flushing if the staging area is full.
    pub fn append_words(&mut self, words: &[u32]) -> DaqResult<()> {
        self.buffer.extend_from_slice(words);
        self.buffers_written += 1;
        if self.buffer.len() >= self.buffer_capacity {
            self.flush()?;
        }
        Ok(())
    }

    fn write_words(&mut self, words: &[u32]) -> DaqResult<()> {
        for word in words {
            self.file.write_all(&word.to_le_bytes())?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> DaqResult<()> {
        if !self.buffer.is_empty() {
            let pending = std::mem::take(&mut self.buffer);
            self.write_words(&pending)?;
            self.words_written += pending.len();
            self.buffer = pending;
            self.buffer.clear();
        }
        self.file.flush()?;
        Ok(())
    }
}

impl OutputSink for RunWriter {
    fn append(&mut self, buffer: EventBuffer) -> DaqResult<()> {
        self.append_words(buffer.words())
    }
}

impl Drop for RunWriter {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("could not flush {}: {}", self.path.display(), e);
        }
    }
}

/// Keeps every buffer in memory, in arrival order.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub buffers: Vec<Vec<u32>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn words(&self) -> impl Iterator<Item = u32> + '_ {
        self.buffers.iter().flatten().copied()
    }
}

impl OutputSink for MemorySink {
    fn append(&mut self, buffer: EventBuffer) -> DaqResult<()> {
        self.buffers.push(buffer.into_words());
        Ok(())
    }
}

/// Hands buffers to a writer thread.
#[derive(Clone)]
pub struct ChannelSink {
    tx: Sender<Vec<u32>>,
}

impl ChannelSink {
    pub fn new(tx: Sender<Vec<u32>>) -> Self {
        Self { tx }
    }
}

impl OutputSink for ChannelSink {
    fn append(&mut self, buffer: EventBuffer) -> DaqResult<()> {
        self.tx.send(buffer.into_words()).map_err(|_| {
            DaqError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "writer thread has gone away",
            ))
        })
    }
}

/// Read a run file back as (header, body) words.
pub fn read_run_file(path: &Path) -> DaqResult<(Vec<u32>, Vec<u32>)> {
    let bytes = std::fs::read(path)?;
    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    if words.len() < RUN_HEADER_WORDS || words[0] != RUN_FILE_MAGIC {
        return Err(DaqError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("{} is not a run file", path.display()),
        )));
    }
    let body = words[RUN_HEADER_WORDS..].to_vec();
    let mut header = words;
    header.truncate(RUN_HEADER_WORDS);
    Ok((header, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn buffer(words: &[u32]) -> EventBuffer {
        let mut buf = EventBuffer::new();
        buf.ensure_capacity(words.len());
        for w in words {
            buf.append(*w).unwrap();
        }
        buf
    }

    #[test]
    fn run_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run3.dat");
        {
            let mut writer = RunWriter::create(&path, 3, 0x1_0000_0002, 4).unwrap();
            writer.append(buffer(&[1, 2])).unwrap();
            assert_eq!(writer.words_written, 0);
            writer.append(buffer(&[3, 4, 5])).unwrap();
            assert_eq!(writer.words_written, 5);
            writer.append(buffer(&[6])).unwrap();
        }
        let (header, body) = read_run_file(&path).unwrap();
        assert_eq!(header, vec![RUN_FILE_MAGIC, RUN_FILE_VERSION, 3, 2, 1]);
        assert_eq!(body, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn not_a_run_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.dat");
        std::fs::write(&path, b"hello world!").unwrap();
        assert!(read_run_file(&path).is_err());
    }

    #[test]
    fn channel_sink_forwards_and_reports_hangup() {
        let (tx, rx) = unbounded();
        let mut sink = ChannelSink::new(tx);
        sink.append(buffer(&[7, 8])).unwrap();
        assert_eq!(rx.recv().unwrap(), vec![7, 8]);
        drop(rx);
        assert!(sink.append(buffer(&[9])).is_err());
    }

    #[test]
    fn memory_sink_keeps_order() {
        let mut sink = MemorySink::new();
        sink.append(buffer(&[1])).unwrap();
        sink.append(buffer(&[2, 3])).unwrap();
        assert_eq!(sink.words().collect::<Vec<_>>(), vec![1, 2, 3]);
    }
}
