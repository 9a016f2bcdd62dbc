use crate::DaqResult;
use log::info;
use std::{
    collections::VecDeque,
    fs,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

/// Throughput statistics, with both *all-time* totals and a
/// *sliding 1 s window* rate.
#[derive(Debug, Clone)]
pub struct Counter {
    /// All-time total words
    pub total_words: usize,
    /// All-time number of buffers
    pub n_buffers: usize,
    /// Time when this counter was created or last reset
    pub t_begin: Instant,

    // --- sliding window fields ---
    window: Duration,
    buffers: VecDeque<(Instant, usize)>,
    words_in_window: usize,
}

impl Default for Counter {
    fn default() -> Self {
        Counter {
            total_words: 0,
            n_buffers: 0,
            t_begin: Instant::now(),
            window: Duration::from_secs(1),
            buffers: VecDeque::new(),
            words_in_window: 0,
        }
    }
}

impl Counter {
    pub fn new() -> Self {
        Default::default()
    }

    /// Long-term average since t_begin, in words/s
    pub fn average_rate(&self) -> f64 {
        let secs = self.t_begin.elapsed().as_secs_f64().max(1e-6);
        self.total_words as f64 / secs
    }

    /// Rate over the last `window`, in words/s
    pub fn rate(&self) -> f64 {
        let secs = self.window.as_secs_f64().max(1e-6);
        self.words_in_window as f64 / secs
    }

    /// Record a buffer of `words` words.
    pub fn increment(&mut self, words: usize) {
        self.increment_at(Instant::now(), words);
    }

    fn increment_at(&mut self, now: Instant, words: usize) {
        self.total_words += words;
        self.n_buffers += 1;

        self.buffers.push_back((now, words));
        self.words_in_window += words;

        while let Some(&(ts, n)) = self.buffers.front() {
            if now.duration_since(ts) > self.window {
                self.buffers.pop_front();
                self.words_in_window -= n;
            } else {
                break;
            }
        }
    }

    pub fn reset(&mut self) {
        self.total_words = 0;
        self.n_buffers = 0;
        self.t_begin = Instant::now();
        self.buffers.clear();
        self.words_in_window = 0;
    }
}

/// `<output_dir>/camp<N>`, created if missing.
pub fn create_camp_dir(output_dir: &Path, campaign_num: usize) -> DaqResult<PathBuf> {
    let path = output_dir.join(format!("camp{}", campaign_num));
    if !path.exists() {
        fs::create_dir_all(&path)?;
        info!("created campaign directory {}", path.display());
    }
    Ok(path)
}

/// One past the highest `run<M>.dat` in `camp_dir`, or 0 if there is none.
pub fn next_run_number(camp_dir: &Path) -> DaqResult<u32> {
    let max_run = fs::read_dir(camp_dir)?
        .filter_map(|e| e.ok())
        .filter_map(|entry| {
            entry.file_name().to_str().and_then(|name| {
                name.strip_prefix("run")?
                    .strip_suffix(".dat")?
                    .parse::<u32>()
                    .ok()
            })
        })
        .max();
    Ok(max_run.map_or(0, |max| max + 1))
}

/// Path and number of the next run file of a campaign.
pub fn create_run_file(output_dir: &Path, campaign_num: usize) -> DaqResult<(PathBuf, u32)> {
    let camp_dir = create_camp_dir(output_dir, campaign_num)?;
    let run = next_run_number(&camp_dir)?;
    Ok((camp_dir.join(format!("run{}.dat", run)), run))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sliding_window_evicts_old_buffers() {
        let mut c = Counter::new();
        let t0 = Instant::now();
        c.increment_at(t0, 100);
        c.increment_at(t0 + Duration::from_millis(500), 50);
        assert_eq!(c.rate(), 150.0);
        c.increment_at(t0 + Duration::from_millis(1600), 10);
        assert_eq!(c.rate(), 10.0);
        assert_eq!(c.total_words, 160);
        assert_eq!(c.n_buffers, 3);
        c.reset();
        assert_eq!(c.total_words, 0);
        assert_eq!(c.rate(), 0.0);
    }

    #[test]
    fn run_numbers_continue_after_highest() {
        let dir = tempfile::tempdir().unwrap();
        let (first, n) = create_run_file(dir.path(), 2).unwrap();
        assert_eq!(n, 0);
        assert_eq!(first, dir.path().join("camp2").join("run0.dat"));

        let camp = dir.path().join("camp2");
        fs::write(camp.join("run0.dat"), b"").unwrap();
        fs::write(camp.join("run7.dat"), b"").unwrap();
        fs::write(camp.join("runner.dat"), b"").unwrap();
        fs::write(camp.join("vme_daq.log"), b"").unwrap();
        assert_eq!(next_run_number(&camp).unwrap(), 8);
    }
}
