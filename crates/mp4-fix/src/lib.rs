//! Fragmented-MP4 to progressive-MP4 rewriting.
//!
//! Segmented downloads land on disk as a long run of `moof`+`mdat` pairs.
//! [`defragment`] rewrites such a file into a progressive MP4: one fresh
//! `moov` whose sample tables are rebuilt from the fragments, one `mdat`,
//! and chunks interleaved across tracks by accumulated duration so playback
//! never seeks far. Non-fragmented input is passed through byte for byte.

use std::io::{self, Read, Seek, SeekFrom, Write};

use mp4box::{
    ContainerBox, CttsBox, ElstBox, ElstEntry, FourCC, IlstItem, MetaBox, Mp4Box, Mp4Error,
    Mp4File, SampleSpan, StcoBox, StscBox, StssBox, SttsBox, StszBox, traf_sample_spans,
};
use tracing::debug;

mod interleave;

use interleave::Interleaver;

#[derive(Debug, thiserror::Error)]
pub enum DefragError {
    #[error(transparent)]
    Mp4(#[from] Mp4Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("cannot defragment: {reason}")]
    Structure { reason: String },
}

fn structure(reason: impl Into<String>) -> DefragError {
    DefragError::Structure {
        reason: reason.into(),
    }
}

/// User-visible metadata injected into the output `udta`.
#[derive(Debug, Clone, Default)]
pub struct TrackMetadata {
    pub copyright: Option<String>,
    pub title: Option<String>,
    pub comment: Option<String>,
    pub date: Option<String>,
}

impl TrackMetadata {
    fn items(&self) -> Vec<IlstItem> {
        let pairs: [(&[u8; 4], &Option<String>); 4] = [
            (b"cprt", &self.copyright),
            (&[0xa9, b'n', b'a', b'm'], &self.title),
            (&[0xa9, b'c', b'm', b't'], &self.comment),
            (&[0xa9, b'd', b'a', b'y'], &self.date),
        ];

        pairs
            .into_iter()
            .filter_map(|(key, value)| {
                value.as_ref().map(|v| IlstItem {
                    key: FourCC::new(key),
                    value: v.clone().into_bytes(),
                })
            })
            .collect()
    }
}

/// Rewrites the fragmented MP4 in `src` as a progressive MP4 in `dst`.
///
/// `src` must be positioned anywhere (it is seeked); `dst` is written
/// sequentially. When `src` is not fragmented the bytes are copied
/// unchanged.
pub fn defragment<R, W>(src: &mut R, dst: &mut W, metadata: &TrackMetadata) -> Result<(), DefragError>
where
    R: Read + Seek,
    W: Write,
{
    let input = Mp4File::decode_reader(src)?;

    if !input.is_fragmented() {
        src.seek(SeekFrom::Start(0))?;
        io::copy(src, dst)?;
        return Ok(());
    }

    let plan = build(&input, metadata)?;

    let mut out = Vec::new();
    Mp4Box::Ftyp(mp4box::FtypBox::isom()).encode_into(&mut out);
    plan.moov.encode_into(&mut out);
    dst.write_all(&out)?;

    let payload: u64 = plan.ranges.iter().map(|r| r.len).sum();
    if payload + 8 > u64::from(u32::MAX) {
        return Err(structure("mdat payload exceeds the compact box size"));
    }

    dst.write_all(&((payload + 8) as u32).to_be_bytes())?;
    dst.write_all(b"mdat")?;

    for range in &plan.ranges {
        src.seek(SeekFrom::Start(range.offset))?;
        let copied = io::copy(&mut src.by_ref().take(range.len), dst)?;
        if copied != range.len {
            return Err(structure("source range truncated during payload copy"));
        }
    }

    debug!(
        ranges = plan.ranges.len(),
        payload, "fragmented input rewritten"
    );

    Ok(())
}

/// A source byte range scheduled for the output `mdat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CopyRange {
    pub offset: u64,
    pub len: u64,
}

struct Plan {
    moov: ContainerBox,
    ranges: Vec<CopyRange>,
}

fn build(input: &Mp4File, metadata: &TrackMetadata) -> Result<Plan, DefragError> {
    let in_moov = input
        .moov
        .as_ref()
        .ok_or_else(|| structure("fragmented input without moov"))?;

    let mut moov = skeleton(in_moov, metadata)?;
    let track_count = moov.traks().len();

    let trexs: Vec<_> = in_moov
        .mvex()
        .map(|mvex| mvex.trexs().into_iter().cloned().collect())
        .unwrap_or_default();

    let timescales: Vec<u64> = moov
        .traks()
        .iter()
        .map(|trak| {
            trak.mdia()
                .and_then(|mdia| mdia.mdhd())
                .map(|mdhd| u64::from(mdhd.timescale.max(1)))
                .ok_or_else(|| structure("trak without mdhd"))
        })
        .collect::<Result<_, _>>()?;

    let mut interleaver = Interleaver::new(&timescales);
    let mut pending: Vec<Vec<SampleSpan>> = vec![Vec::new(); track_count];
    let mut total_sync_samples = 0u32;

    let fragment_count: usize = input.segments.iter().map(|s| s.fragments.len()).sum();
    let mut seen_fragments = 0usize;

    for segment in &input.segments {
        for fragment in &segment.fragments {
            seen_fragments += 1;

            let trafs = fragment.moof.trafs();
            if trafs.len() != track_count {
                return Err(structure(format!(
                    "fragment has {} trafs for {} tracks",
                    trafs.len(),
                    track_count
                )));
            }

            for (track_index, traf) in trafs.into_iter().enumerate() {
                let spans = traf_sample_spans(fragment, traf, trexs.get(track_index))?;

                gather(&mut moov, track_index, &spans)?;

                if track_index == 0 {
                    // Fragment boundaries of the first track become the
                    // sync sample table.
                    let stss = track_stbl_mut(&mut moov, 0)?
                        .stss_mut()
                        .ok_or_else(|| structure("first track lost its stss"))?;
                    stss.sample_numbers.push(total_sync_samples + 1);
                    total_sync_samples += spans.len() as u32;
                }

                pending[track_index] = spans;
            }

            let last = seen_fragments == fragment_count;
            interleaver.next(&mut pending, &mut moov, last)?;
        }
    }

    finalize(&mut moov, &interleaver)?;

    Ok(Plan {
        ranges: interleaver.into_ranges(),
        moov,
    })
}

/// Fresh `moov` skeleton: copied headers, empty sample tables.
fn skeleton(in_moov: &ContainerBox, metadata: &TrackMetadata) -> Result<ContainerBox, DefragError> {
    let mut moov = ContainerBox::new(b"moov");

    let mut mvhd = in_moov
        .mvhd()
        .cloned()
        .ok_or_else(|| structure("input moov without mvhd"))?;
    mvhd.timescale = 1000;
    moov.push(Mp4Box::Mvhd(mvhd));

    for (index, in_trak) in in_moov.traks().into_iter().enumerate() {
        moov.push(Mp4Box::Trak(skeleton_trak(in_trak, index)?));
    }

    let mut udta = ContainerBox::new(b"udta");
    udta.push(Mp4Box::Meta(MetaBox::item_list(metadata.items())));
    moov.push(Mp4Box::Udta(udta));

    Ok(moov)
}

fn skeleton_trak(in_trak: &ContainerBox, index: usize) -> Result<ContainerBox, DefragError> {
    let mut trak = ContainerBox::new(b"trak");
    let has_edts = in_trak.edts().is_some();

    let in_mdia = in_trak
        .mdia()
        .ok_or_else(|| structure("input trak without mdia"))?;
    let is_video = in_mdia.hdlr().is_some_and(|hdlr| hdlr.is_video());

    for child in &in_trak.children {
        match child {
            Mp4Box::Tkhd(tkhd) => {
                trak.push(Mp4Box::Tkhd(tkhd.clone()));

                if !has_edts {
                    let mut edts = ContainerBox::new(b"edts");
                    edts.push(Mp4Box::Elst(ElstBox::default()));
                    trak.push(Mp4Box::Edts(edts));
                }
            }
            Mp4Box::Edts(edts) => {
                let mut edts = edts.clone();
                if edts.elst().is_none() {
                    edts.push(Mp4Box::Elst(ElstBox::default()));
                }
                trak.push(Mp4Box::Edts(edts));
            }
            Mp4Box::Mdia(_) => trak.push(Mp4Box::Mdia(skeleton_mdia(in_mdia, index, is_video)?)),
            other => trak.push(other.clone()),
        }
    }

    if trak.tkhd().is_none() {
        return Err(structure("input trak without tkhd"));
    }

    Ok(trak)
}

fn skeleton_mdia(
    in_mdia: &ContainerBox,
    index: usize,
    is_video: bool,
) -> Result<ContainerBox, DefragError> {
    let mut mdia = ContainerBox::new(b"mdia");

    for child in &in_mdia.children {
        match child {
            Mp4Box::Minf(in_minf) => {
                let mut minf = ContainerBox::new(b"minf");

                for minf_child in &in_minf.children {
                    match minf_child {
                        Mp4Box::Stbl(in_stbl) => {
                            minf.push(Mp4Box::Stbl(skeleton_stbl(in_stbl, index, is_video)))
                        }
                        other => minf.push(other.clone()),
                    }
                }

                mdia.push(Mp4Box::Minf(minf));
            }
            other => mdia.push(other.clone()),
        }
    }

    if mdia.mdhd().is_none() {
        return Err(structure("input mdia without mdhd"));
    }
    if mdia.minf().is_none() {
        return Err(structure("input mdia without minf"));
    }

    Ok(mdia)
}

fn skeleton_stbl(in_stbl: &ContainerBox, index: usize, is_video: bool) -> ContainerBox {
    let mut stbl = ContainerBox::new(b"stbl");

    // stsd is carried over unchanged; the tables are rebuilt from samples.
    for child in &in_stbl.children {
        if child.fourcc() == FourCC::new(b"stsd") {
            stbl.push(child.clone());
        }
    }

    stbl.push(Mp4Box::Stts(SttsBox::default()));
    if index == 0 {
        stbl.push(Mp4Box::Stss(StssBox::default()));
    }
    if is_video {
        stbl.push(Mp4Box::Ctts(CttsBox::default()));
    }
    stbl.push(Mp4Box::Stsc(StscBox::default()));
    stbl.push(Mp4Box::Stsz(StszBox::default()));
    stbl.push(Mp4Box::Stco(StcoBox::default()));

    const REBUILT: [&[u8; 4]; 7] = [b"stsd", b"stts", b"stss", b"ctts", b"stsc", b"stsz", b"stco"];

    for child in &in_stbl.children {
        if !REBUILT.contains(&&child.fourcc().0) {
            stbl.push(child.clone());
        }
    }

    stbl
}

pub(crate) fn track_stbl_mut(
    moov: &mut ContainerBox,
    track_index: usize,
) -> Result<&mut ContainerBox, DefragError> {
    let trak = moov
        .traks_mut()
        .into_iter()
        .nth(track_index)
        .ok_or_else(|| structure("track index out of range"))?;

    trak.mdia_mut()
        .and_then(|mdia| mdia.minf_mut())
        .and_then(|minf| minf.stbl_mut())
        .ok_or_else(|| structure("track without sample table"))
}

/// Folds one traf's samples into the track's timing and size tables.
fn gather(
    moov: &mut ContainerBox,
    track_index: usize,
    spans: &[SampleSpan],
) -> Result<(), DefragError> {
    let stbl = track_stbl_mut(moov, track_index)?;

    let has_ctts = stbl.ctts().is_some();

    for span in spans {
        if let Some(stts) = stbl.stts_mut() {
            stts.push_sample(span.duration);
        }
        if has_ctts
            && let Some(ctts) = stbl.ctts_mut()
        {
            ctts.push_sample(span.composition_time_offset);
        }
        if let Some(stsz) = stbl.stsz_mut() {
            stsz.push_sample(span.size);
        }
    }

    Ok(())
}

/// Durations, edit lists and chunk offset rebasing.
fn finalize(moov: &mut ContainerBox, interleaver: &Interleaver) -> Result<(), DefragError> {
    let track_count = moov.traks().len();

    for track_index in 0..track_count {
        let nanos = interleaver.track_duration_nanos(track_index);
        let tick_nanos = interleaver.tick_nanos(track_index);

        let duration_ms = nanos / 1_000_000;
        let duration_ticks = if tick_nanos == 0 { 0 } else { nanos / tick_nanos };

        let mut traks = moov.traks_mut();
        let trak = traks
            .get_mut(track_index)
            .ok_or_else(|| structure("track index out of range"))?;

        if let Some(tkhd) = trak.tkhd_mut() {
            tkhd.duration = duration_ms;
        }
        if let Some(mdhd) = trak.mdia_mut().and_then(|m| m.mdhd_mut()) {
            mdhd.duration = duration_ticks;
        }
        if let Some(elst) = trak.edts_mut().and_then(|e| e.elst_mut()) {
            elst.entries = vec![ElstEntry {
                segment_duration: duration_ms,
                media_time: 0,
                media_rate_integer: 1,
                media_rate_fraction: 0,
            }];
        }

        if track_index == 0 {
            let duration = duration_ms;
            if let Some(mvhd) = moov.mvhd_mut() {
                mvhd.duration = duration;
            }
        }
    }

    // Chunk offsets were accumulated relative to the mdat payload; rebase
    // them once the leading box sizes are known.
    let ftyp_len = Mp4Box::Ftyp(mp4box::FtypBox::isom()).encoded_len();
    let mdat_payload_start = (ftyp_len + moov.encoded_len() + 8) as u32;

    for trak in moov.traks_mut() {
        if let Some(stco) = trak
            .mdia_mut()
            .and_then(|m| m.minf_mut())
            .and_then(|m| m.stbl_mut())
            .and_then(|s| s.stco_mut())
        {
            for offset in &mut stco.chunk_offsets {
                *offset += mdat_payload_start;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests;
