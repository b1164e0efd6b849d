// Combining per-stream fMP4 downloads into one multi-track stream.
//
// Segmented delivery hands the pipeline one init segment and one media
// segment per stream (video first, then audio). Each pair is merged into a
// single fragmented file: init segments become one `moov` with renumbered
// tracks, media segments become one multi-track fragment.

use bytes::Bytes;

use crate::Mp4Error;
use crate::boxes::Mp4Box;
use crate::file::Mp4File;
use crate::frag::{FragmentBuilder, traf_full_samples};

/// Merges single-track init segments into one combined init.
///
/// The i-th input (1-based) becomes track i: `tkhd` and `trex` track ids are
/// renumbered, the first input keeps its `moov` skeleton and the others
/// contribute their `trak`, `trex` and `mehd` children.
pub fn combine_init_segments(files: &[Bytes]) -> Result<Vec<u8>, Mp4Error> {
    let mut combined = None;

    for (i, data) in files.iter().enumerate() {
        let track_id = i as u32 + 1;
        let file = Mp4File::decode_bytes(data)?;

        let mut moov = file
            .moov
            .ok_or_else(|| Mp4Error::parse("init segment without moov"))?;

        if moov.traks().len() != 1 {
            return Err(Mp4Error::parse("expected exactly one track per init segment"));
        }

        let trak = moov
            .traks_mut()
            .into_iter()
            .next()
            .expect("track count checked above");
        let tkhd = trak
            .tkhd_mut()
            .ok_or_else(|| Mp4Error::parse("init trak without tkhd"))?;
        tkhd.track_id = track_id;

        if let Some(mvex) = moov.mvex_mut()
            && let Some(trex) = mvex.trexs_mut().into_iter().next()
        {
            trex.track_id = track_id;
        }

        if i == 0 {
            let ftyp = file
                .ftyp
                .ok_or_else(|| Mp4Error::parse("init segment without ftyp"))?;
            combined = Some((ftyp, moov));
            continue;
        }

        let (_, target) = combined
            .as_mut()
            .expect("first iteration populates the combined init");

        let mut trak = None;
        let mut extras = Vec::new();

        for child in moov.children {
            match child {
                Mp4Box::Trak(t) => trak = Some(t),
                Mp4Box::Mvex(mvex) => {
                    for grandchild in mvex.children {
                        if matches!(grandchild, Mp4Box::Trex(_) | Mp4Box::Mehd(_)) {
                            extras.push(grandchild);
                        }
                    }
                }
                _ => {}
            }
        }

        target.push(Mp4Box::Trak(trak.expect("track count checked above")));

        let target_mvex = target
            .mvex_mut()
            .ok_or_else(|| Mp4Error::parse("combined init without mvex"))?;
        for extra in extras {
            target_mvex.push(extra);
        }
    }

    let (ftyp, moov) =
        combined.ok_or_else(|| Mp4Error::parse("no init segments to combine"))?;

    let mut out = Vec::new();
    Mp4Box::Ftyp(ftyp).encode_into(&mut out);
    moov.encode_into(&mut out);

    Ok(out)
}

/// Merges single-track media segments into one multi-track fragment.
///
/// Expects exactly one segment per input; every input fragment's samples are
/// appended to output track i+1. `sidx` boxes are carried over with the
/// reference id renumbered, then rewritten so each reference covers the
/// combined fragment and the offsets chain from the end.
pub fn combine_media_segments(files: &[Bytes]) -> Result<Vec<u8>, Mp4Error> {
    let track_ids: Vec<u32> = (1..=files.len() as u32).collect();

    let mut styp = None;
    let mut sidxs = Vec::new();
    let mut builder: Option<FragmentBuilder> = None;

    for (i, data) in files.iter().enumerate() {
        let track_id = i as u32 + 1;
        let file = Mp4File::decode_bytes(data)?;

        if file.segments.len() != 1 {
            return Err(Mp4Error::parse("expected exactly one media segment per file"));
        }

        let segment = file.segments.into_iter().next().expect("length checked");

        if i == 0 {
            styp = segment.styp;
        }

        for mut sidx in segment.sidxs {
            sidx.reference_id = track_id;
            sidxs.push(sidx);
        }

        for fragment in &segment.fragments {
            let trafs = fragment.moof.trafs();
            if trafs.len() != 1 {
                return Err(Mp4Error::parse("expected exactly one traf per fragment"));
            }

            let builder = builder.get_or_insert_with(|| {
                let sequence = fragment
                    .moof
                    .mfhd()
                    .map(|m| m.sequence_number)
                    .unwrap_or(1);
                FragmentBuilder::new(sequence, &track_ids)
            });

            for sample in traf_full_samples(fragment, trafs[0], None, data)? {
                builder.add_sample(track_id, sample)?;
            }
        }
    }

    let builder =
        builder.ok_or_else(|| Mp4Error::parse("no media fragments to combine"))?;
    let fragment_len = builder.encoded_len();

    // Each sidx references the whole combined fragment; first_offset chains
    // across the sidx boxes that sit between it and the fragment.
    let mut chained = 0u64;
    for sidx in sidxs.iter_mut().rev() {
        sidx.first_offset = chained;
        for reference in &mut sidx.references {
            reference.referenced_size = fragment_len as u32;
        }
        chained += Mp4Box::Sidx(sidx.clone()).encoded_len();
    }

    let mut out = Vec::new();

    if let Some(styp) = styp {
        Mp4Box::Styp(styp).encode_into(&mut out);
    }
    for sidx in sidxs {
        Mp4Box::Sidx(sidx).encode_into(&mut out);
    }
    builder.encode_into(&mut out);

    Ok(out)
}
