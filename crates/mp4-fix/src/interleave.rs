// Duration-balanced chunk interleaving.
//
// Tracks advance together: each pass drains samples from every track until
// its accumulated duration reaches the pass ceiling, producing one chunk
// per track. Batches are double-buffered so the final partial batch can be
// merged with its predecessor at end of stream instead of emitting a
// degenerate trailing chunk.

use mp4box::{ContainerBox, SampleSpan};

use crate::{CopyRange, DefragError, track_stbl_mut};

pub(crate) struct Interleaver {
    tick_nanos: Vec<u64>,
    durations: Vec<u64>,
    target: Vec<CopyRange>,
    incomplete: Vec<Vec<CopyRange>>,
    complete: Vec<Vec<CopyRange>>,
    chunk_id: u32,
    offset: u32,
    buffering: bool,
    primed: bool,
}

impl Interleaver {
    pub(crate) fn new(timescales: &[u64]) -> Self {
        let tick_nanos = timescales
            .iter()
            .map(|&ts| if ts == 0 { 0 } else { 1_000_000_000 / ts })
            .collect();

        Interleaver {
            tick_nanos,
            durations: vec![0; timescales.len()],
            target: Vec::new(),
            incomplete: vec![Vec::new(); timescales.len()],
            complete: vec![Vec::new(); timescales.len()],
            chunk_id: 1,
            offset: 0,
            buffering: false,
            primed: false,
        }
    }

    pub(crate) fn tick_nanos(&self, track_index: usize) -> u64 {
        self.tick_nanos[track_index]
    }

    pub(crate) fn track_duration_nanos(&self, track_index: usize) -> u64 {
        self.durations[track_index]
    }

    pub(crate) fn into_ranges(self) -> Vec<CopyRange> {
        self.target
    }

    /// Pass ceiling: the accumulated duration of the track whose next
    /// sample is longest, plus that sample. `None` once every track is dry.
    fn pass_ceiling(&self, pending: &[Vec<SampleSpan>]) -> Option<u64> {
        let mut ceiling = 0u64;
        let mut base = 0u64;
        let mut present = false;

        for (track_index, samples) in pending.iter().enumerate() {
            let Some(first) = samples.first() else {
                continue;
            };
            present = true;

            let dur = u64::from(first.duration) * self.tick_nanos[track_index];
            if dur > ceiling {
                ceiling = dur;
                base = self.durations[track_index];
            }
        }

        present.then_some(ceiling + base)
    }

    /// Drains one track up to the ceiling, one copy range per sample.
    fn drain_track(
        &mut self,
        pending: &mut [Vec<SampleSpan>],
        track_index: usize,
        ceiling: u64,
    ) -> Vec<CopyRange> {
        let samples = &mut pending[track_index];
        let mut targets = Vec::new();
        let mut consumed = 0;

        for (idx, sample) in samples.iter().enumerate() {
            targets.push(CopyRange {
                offset: sample.offset,
                len: u64::from(sample.size),
            });

            self.durations[track_index] +=
                u64::from(sample.duration) * self.tick_nanos[track_index];
            consumed = idx + 1;

            if self.durations[track_index] >= ceiling {
                break;
            }
        }

        samples.drain(..consumed);
        targets
    }

    /// Consumes the fragment's pending samples, emitting chunks.
    pub(crate) fn next(
        &mut self,
        pending: &mut Vec<Vec<SampleSpan>>,
        moov: &mut ContainerBox,
        last: bool,
    ) -> Result<(), DefragError> {
        let track_count = pending.len();
        let mut available = 0usize;

        while let Some(ceiling) = self.pass_ceiling(pending) {
            available = 0;

            for track_index in 0..track_count {
                let targets = self.drain_track(pending, track_index, ceiling);

                if targets.is_empty() {
                    self.buffering = true;
                    continue;
                }

                self.incomplete[track_index].extend(targets);
                available += 1;
            }

            if available == track_count {
                self.buffering = false;

                if self.primed {
                    self.append_complete(moov)?;
                } else {
                    self.primed = true;
                }

                for track_index in 0..track_count {
                    self.complete[track_index] = std::mem::take(&mut self.incomplete[track_index]);
                }
            }
        }

        let finalize = self.buffering && last;

        if finalize {
            for track_index in 0..track_count {
                let rest = std::mem::take(&mut self.incomplete[track_index]);
                self.complete[track_index].extend(rest);
            }
        }

        if available == track_count || finalize {
            self.append_complete(moov)?;
            self.primed = false;
        }

        Ok(())
    }

    /// Emits the buffered batch: one chunk per track, contiguous source
    /// ranges coalesced, sample tables updated.
    fn append_complete(&mut self, moov: &mut ContainerBox) -> Result<(), DefragError> {
        for track_index in 0..self.complete.len() {
            let samples = std::mem::take(&mut self.complete[track_index]);
            let sample_count = samples.len() as u32;
            let mut chunk_len = 0u32;

            for range in samples {
                match self.target.last_mut() {
                    Some(last) if last.offset + last.len == range.offset => last.len += range.len,
                    _ => self.target.push(range),
                }
                chunk_len += range.len as u32;
            }

            let stbl = track_stbl_mut(moov, track_index)?;

            if let Some(stsc) = stbl.stsc_mut() {
                stsc.push_run(self.chunk_id, sample_count);
            }
            if let Some(stco) = stbl.stco_mut() {
                stco.chunk_offsets.push(self.offset);
            }

            self.offset += chunk_len;
        }

        self.chunk_id += 1;

        Ok(())
    }
}
