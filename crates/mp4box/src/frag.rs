// Fragment sample resolution and multi-track fragment construction.

use bytes::Bytes;

use crate::Mp4Error;
use crate::boxes::{
    ContainerBox, MfhdBox, Mp4Box, TFHD_DEFAULT_SAMPLE_DURATION, TFHD_DEFAULT_SAMPLE_FLAGS,
    TFHD_DEFAULT_SAMPLE_SIZE, TRUN_DATA_OFFSET, TRUN_FIRST_SAMPLE_FLAGS, TRUN_SAMPLE_CTO,
    TRUN_SAMPLE_DURATION, TRUN_SAMPLE_FLAGS, TRUN_SAMPLE_SIZE, TfhdBox, TrexBox, TrunBox,
    TrunSample,
};
use crate::file::Fragment;
use crate::header::{begin_box, end_box};

/// One sample with every field resolved against `tfhd`/`trex` defaults,
/// located at an absolute offset in the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleSpan {
    pub duration: u32,
    pub size: u32,
    pub flags: u32,
    pub composition_time_offset: i32,
    /// Absolute offset of the sample payload within the source.
    pub offset: u64,
}

/// A resolved sample together with its payload bytes.
#[derive(Debug, Clone)]
pub struct FullSample {
    pub duration: u32,
    pub size: u32,
    pub flags: u32,
    pub composition_time_offset: i32,
    pub data: Bytes,
}

/// Resolves every sample of one `traf` to `(fields, absolute offset)`.
///
/// The data anchor is the enclosing `moof` start, overridden by an explicit
/// `tfhd` base-data-offset, shifted by the `trun` data offset; a zero anchor
/// falls back to the `mdat` payload offset.
pub fn traf_sample_spans(
    fragment: &Fragment,
    traf: &ContainerBox,
    trex: Option<&TrexBox>,
) -> Result<Vec<SampleSpan>, Mp4Error> {
    let tfhd = traf
        .tfhd()
        .ok_or_else(|| Mp4Error::parse("traf without tfhd"))?;

    let mut spans = Vec::new();

    for trun in traf.truns() {
        let mut offset = fragment.moof_start;

        if let Some(base) = tfhd.base_data_offset.filter(|_| tfhd.has_base_data_offset()) {
            offset = base;
        }

        if let Some(data_offset) = trun.data_offset {
            offset = offset.wrapping_add_signed(i64::from(data_offset));
        }

        if offset == 0 {
            offset = fragment.mdat.payload_offset;
        }

        for (i, sample) in trun.samples.iter().enumerate() {
            let duration = sample
                .duration
                .or(tfhd.default_sample_duration)
                .or(trex.map(|t| t.default_sample_duration))
                .unwrap_or(0);
            let size = sample
                .size
                .or(tfhd.default_sample_size)
                .or(trex.map(|t| t.default_sample_size))
                .unwrap_or(0);
            let flags = sample
                .flags
                .or((i == 0).then_some(trun.first_sample_flags).flatten())
                .or(tfhd.default_sample_flags)
                .or(trex.map(|t| t.default_sample_flags))
                .unwrap_or(0);

            spans.push(SampleSpan {
                duration,
                size,
                flags,
                composition_time_offset: sample.composition_time_offset.unwrap_or(0),
                offset,
            });

            offset += u64::from(size);
        }
    }

    Ok(spans)
}

/// Like [`traf_sample_spans`] but slices the payload out of `source`.
pub fn traf_full_samples(
    fragment: &Fragment,
    traf: &ContainerBox,
    trex: Option<&TrexBox>,
    source: &Bytes,
) -> Result<Vec<FullSample>, Mp4Error> {
    let spans = traf_sample_spans(fragment, traf, trex)?;
    let mut samples = Vec::with_capacity(spans.len());

    for span in spans {
        let start = span.offset as usize;
        let end = start + span.size as usize;

        if end > source.len() {
            return Err(Mp4Error::parse("sample payload outside source buffer"));
        }

        samples.push(FullSample {
            duration: span.duration,
            size: span.size,
            flags: span.flags,
            composition_time_offset: span.composition_time_offset,
            data: source.slice(start..end),
        });
    }

    Ok(samples)
}

struct TrackAccumulator {
    track_id: u32,
    samples: Vec<FullSample>,
    data_len: u64,
}

/// Builds one multi-track `moof`+`mdat` pair sample by sample.
///
/// The encoded `trun`s are optimised: per-sample fields collapse into
/// `tfhd` defaults whenever uniform across a track.
pub struct FragmentBuilder {
    sequence_number: u32,
    tracks: Vec<TrackAccumulator>,
}

impl FragmentBuilder {
    pub fn new(sequence_number: u32, track_ids: &[u32]) -> Self {
        FragmentBuilder {
            sequence_number,
            tracks: track_ids
                .iter()
                .map(|&track_id| TrackAccumulator {
                    track_id,
                    samples: Vec::new(),
                    data_len: 0,
                })
                .collect(),
        }
    }

    pub fn add_sample(&mut self, track_id: u32, sample: FullSample) -> Result<(), Mp4Error> {
        let track = self
            .tracks
            .iter_mut()
            .find(|t| t.track_id == track_id)
            .ok_or_else(|| {
                Mp4Error::unsupported(format!("fragment has no track {track_id}"))
            })?;

        track.data_len += u64::from(sample.size);
        track.samples.push(sample);

        Ok(())
    }

    fn moof(&self, data_offsets: &[i32]) -> ContainerBox {
        let mut moof = ContainerBox::new(b"moof");
        moof.push(Mp4Box::Mfhd(MfhdBox {
            sequence_number: self.sequence_number,
        }));

        for (track, &data_offset) in self.tracks.iter().zip(data_offsets) {
            let mut traf = ContainerBox::new(b"traf");
            let (tfhd, trun) = optimize_track(track, data_offset);
            traf.push(Mp4Box::Tfhd(tfhd));
            traf.push(Mp4Box::Trun(trun));
            moof.push(Mp4Box::Traf(traf));
        }

        moof
    }

    /// Total encoded size of `moof` plus `mdat`.
    pub fn encoded_len(&self) -> u64 {
        let zeros = vec![0i32; self.tracks.len()];
        let moof_len = self.moof(&zeros).encoded_len();
        let data_len: u64 = self.tracks.iter().map(|t| t.data_len).sum();

        moof_len + 8 + data_len
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        // Offsets are relative to the moof start (default-base-is-moof);
        // field widths do not depend on the offset values, so a first pass
        // with placeholders measures the layout.
        let zeros = vec![0i32; self.tracks.len()];
        let moof_len = self.moof(&zeros).encoded_len();

        let mut data_offsets = Vec::with_capacity(self.tracks.len());
        let mut running = moof_len + 8;
        for track in &self.tracks {
            data_offsets.push(running as i32);
            running += track.data_len;
        }

        self.moof(&data_offsets).encode_into(out);

        let mdat_start = begin_box(out, crate::header::FourCC::new(b"mdat"));
        for track in &self.tracks {
            for sample in &track.samples {
                out.extend_from_slice(&sample.data);
            }
        }
        end_box(out, mdat_start);
    }
}

fn uniform<T: Copy + PartialEq>(values: impl Iterator<Item = T>) -> Option<T> {
    let mut values = values;
    let first = values.next()?;
    values.all(|v| v == first).then_some(first)
}

/// Collapses uniform per-sample fields into tfhd defaults.
fn optimize_track(track: &TrackAccumulator, data_offset: i32) -> (TfhdBox, TrunBox) {
    let mut tfhd = TfhdBox::default_base_is_moof(track.track_id);
    let mut flags = TRUN_DATA_OFFSET;

    let samples = &track.samples;

    match uniform(samples.iter().map(|s| s.duration)) {
        Some(duration) if !samples.is_empty() => {
            tfhd.flags |= TFHD_DEFAULT_SAMPLE_DURATION;
            tfhd.default_sample_duration = Some(duration);
        }
        _ => flags |= TRUN_SAMPLE_DURATION,
    }

    match uniform(samples.iter().map(|s| s.size)) {
        Some(size) if !samples.is_empty() => {
            tfhd.flags |= TFHD_DEFAULT_SAMPLE_SIZE;
            tfhd.default_sample_size = Some(size);
        }
        _ => flags |= TRUN_SAMPLE_SIZE,
    }

    let mut first_sample_flags = None;

    match uniform(samples.iter().map(|s| s.flags)) {
        Some(sample_flags) if !samples.is_empty() => {
            tfhd.flags |= TFHD_DEFAULT_SAMPLE_FLAGS;
            tfhd.default_sample_flags = Some(sample_flags);
        }
        _ => {
            // A sync-sample lead followed by uniform flags is the common
            // video shape; express it with first-sample-flags.
            let rest = uniform(samples.iter().skip(1).map(|s| s.flags));
            match rest {
                Some(rest_flags) if samples.len() > 1 => {
                    tfhd.flags |= TFHD_DEFAULT_SAMPLE_FLAGS;
                    tfhd.default_sample_flags = Some(rest_flags);
                    flags |= TRUN_FIRST_SAMPLE_FLAGS;
                    first_sample_flags = Some(samples[0].flags);
                }
                _ => flags |= TRUN_SAMPLE_FLAGS,
            }
        }
    }

    if samples.iter().any(|s| s.composition_time_offset != 0) {
        flags |= TRUN_SAMPLE_CTO;
    }

    let trun_samples = samples
        .iter()
        .map(|s| TrunSample {
            duration: (flags & TRUN_SAMPLE_DURATION != 0).then_some(s.duration),
            size: (flags & TRUN_SAMPLE_SIZE != 0).then_some(s.size),
            flags: (flags & TRUN_SAMPLE_FLAGS != 0).then_some(s.flags),
            composition_time_offset: (flags & TRUN_SAMPLE_CTO != 0)
                .then_some(s.composition_time_offset),
        })
        .collect();

    let trun = TrunBox {
        flags,
        data_offset: Some(data_offset),
        first_sample_flags,
        samples: trun_samples,
    };

    (tfhd, trun)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::Mp4File;

    fn sample(size: u32, duration: u32, flags: u32, cto: i32, byte: u8) -> FullSample {
        FullSample {
            duration,
            size,
            flags,
            composition_time_offset: cto,
            data: Bytes::from(vec![byte; size as usize]),
        }
    }

    #[test]
    fn builder_round_trips_through_decoder() {
        let mut builder = FragmentBuilder::new(7, &[1, 2]);
        builder.add_sample(1, sample(4, 512, 0x0200_0000, 0, 0xaa)).unwrap();
        builder.add_sample(1, sample(6, 512, 0x0101_0000, 512, 0xbb)).unwrap();
        builder.add_sample(2, sample(3, 1024, 0x0200_0000, 0, 0xcc)).unwrap();

        let mut buf = Vec::new();
        builder.encode_into(&mut buf);
        assert_eq!(buf.len() as u64, builder.encoded_len());

        let data = Bytes::from(buf);
        let file = Mp4File::decode_bytes(&data).unwrap();
        assert_eq!(file.segments.len(), 1);

        let fragment = &file.segments[0].fragments[0];
        assert_eq!(fragment.moof.mfhd().unwrap().sequence_number, 7);

        let trafs = fragment.moof.trafs();
        assert_eq!(trafs.len(), 2);

        let video = traf_full_samples(fragment, trafs[0], None, &data).unwrap();
        assert_eq!(video.len(), 2);
        assert_eq!(video[0].data.as_ref(), &[0xaa; 4]);
        assert_eq!(video[1].data.as_ref(), &[0xbb; 6]);
        assert_eq!(video[1].composition_time_offset, 512);

        let audio = traf_full_samples(fragment, trafs[1], None, &data).unwrap();
        assert_eq!(audio.len(), 1);
        assert_eq!(audio[0].duration, 1024);
        assert_eq!(audio[0].data.as_ref(), &[0xcc; 3]);
    }

    #[test]
    fn uniform_fields_collapse_into_defaults() {
        let mut builder = FragmentBuilder::new(1, &[1]);
        for _ in 0..4 {
            builder.add_sample(1, sample(8, 1024, 0x0200_0000, 0, 0x11)).unwrap();
        }

        let mut buf = Vec::new();
        builder.encode_into(&mut buf);

        let file = Mp4File::decode_bytes(&Bytes::from(buf)).unwrap();
        let fragment = &file.segments[0].fragments[0];
        let traf = fragment.moof.trafs()[0];
        let tfhd = traf.tfhd().unwrap();
        let trun = &traf.truns()[0];

        assert_eq!(tfhd.default_sample_duration, Some(1024));
        assert_eq!(tfhd.default_sample_size, Some(8));
        assert_eq!(tfhd.default_sample_flags, Some(0x0200_0000));
        assert_eq!(trun.flags & TRUN_SAMPLE_DURATION, 0);
        assert_eq!(trun.flags & TRUN_SAMPLE_SIZE, 0);
        assert_eq!(trun.flags & TRUN_SAMPLE_FLAGS, 0);
        assert_eq!(trun.samples.len(), 4);
    }

    #[test]
    fn sync_lead_uses_first_sample_flags() {
        let mut builder = FragmentBuilder::new(1, &[1]);
        builder.add_sample(1, sample(4, 512, 0x0200_0000, 0, 0x01)).unwrap();
        builder.add_sample(1, sample(4, 512, 0x0101_0000, 0, 0x02)).unwrap();
        builder.add_sample(1, sample(4, 512, 0x0101_0000, 0, 0x03)).unwrap();

        let mut buf = Vec::new();
        builder.encode_into(&mut buf);

        let file = Mp4File::decode_bytes(&Bytes::from(buf)).unwrap();
        let traf = file.segments[0].fragments[0].moof.trafs()[0].clone();
        let trun = &traf.truns()[0];

        assert_eq!(trun.first_sample_flags, Some(0x0200_0000));
        assert_eq!(traf.tfhd().unwrap().default_sample_flags, Some(0x0101_0000));
    }

    #[test]
    fn add_sample_to_unknown_track_fails() {
        let mut builder = FragmentBuilder::new(1, &[1]);
        assert!(builder.add_sample(9, sample(1, 1, 0, 0, 0)).is_err());
    }
}
