use std::io::Cursor;

use bytes::Bytes;
use mp4box::{
    ContainerBox, FourCC, FragmentBuilder, FtypBox, FullSample, HdlrBox, MdhdBox, Mp4Box,
    Mp4File, MvhdBox, RawBox, TkhdBox, TrexBox, combine_init_segments, combine_media_segments,
};

use super::{TrackMetadata, defragment};

fn raw(fourcc: &[u8; 4], data: &'static [u8]) -> Mp4Box {
    Mp4Box::Raw(RawBox {
        fourcc: FourCC::new(fourcc),
        data: Bytes::from_static(data),
    })
}

fn init_segment(handler: &[u8; 4], timescale: u32) -> Bytes {
    let mut trak = ContainerBox::new(b"trak");
    trak.push(Mp4Box::Tkhd(TkhdBox {
        flags: 3,
        creation_time: 0,
        modification_time: 0,
        track_id: 1,
        duration: 0,
        layer: 0,
        alternate_group: 0,
        volume: 0,
        matrix: [0; 36],
        width: 640 << 16,
        height: 360 << 16,
    }));

    let mut stbl = ContainerBox::new(b"stbl");
    stbl.push(raw(b"stsd", &[0, 0, 0, 0, 0, 0, 0, 1]));

    let mut minf = ContainerBox::new(b"minf");
    minf.push(raw(b"vmhd", &[0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0]));
    minf.push(Mp4Box::Stbl(stbl));

    let mut mdia = ContainerBox::new(b"mdia");
    mdia.push(Mp4Box::Mdhd(MdhdBox {
        creation_time: 0,
        modification_time: 0,
        timescale,
        duration: 0,
        language: 0x55c4,
    }));
    mdia.push(Mp4Box::Hdlr(HdlrBox::new(handler)));
    mdia.push(Mp4Box::Minf(minf));
    trak.push(Mp4Box::Mdia(mdia));

    let mut mvex = ContainerBox::new(b"mvex");
    mvex.push(Mp4Box::Trex(TrexBox {
        track_id: 1,
        default_sample_description_index: 1,
        default_sample_duration: 0,
        default_sample_size: 0,
        default_sample_flags: 0,
    }));

    let mut moov = ContainerBox::new(b"moov");
    moov.push(Mp4Box::Mvhd(MvhdBox::default()));
    moov.push(Mp4Box::Trak(trak));
    moov.push(Mp4Box::Mvex(mvex));

    let mut out = Vec::new();
    Mp4Box::Ftyp(FtypBox::isom()).encode_into(&mut out);
    moov.encode_into(&mut out);

    Bytes::from(out)
}

fn media_segment(samples: &[(&[u8], u32)], sequence: u32) -> Bytes {
    let mut builder = FragmentBuilder::new(sequence, &[1]);

    for (payload, duration) in samples {
        builder
            .add_sample(
                1,
                FullSample {
                    duration: *duration,
                    size: payload.len() as u32,
                    flags: 0x0200_0000,
                    composition_time_offset: 0,
                    data: Bytes::copy_from_slice(payload),
                },
            )
            .unwrap();
    }

    let mut out = Vec::new();
    builder.encode_into(&mut out);
    Bytes::from(out)
}

/// Builds the staging-file shape a segmented download produces: one
/// combined init then one combined fragment per chunk.
fn staging_file(chunks: &[(Vec<(&[u8], u32)>, Vec<(&[u8], u32)>)]) -> Vec<u8> {
    let video_init = init_segment(b"vide", 1000);
    let audio_init = init_segment(b"soun", 1000);

    let mut file = combine_init_segments(&[video_init, audio_init]).unwrap();

    for (sequence, (video, audio)) in chunks.iter().enumerate() {
        let video_seg = media_segment(video, sequence as u32 + 1);
        let audio_seg = media_segment(audio, sequence as u32 + 1);
        file.extend_from_slice(&combine_media_segments(&[video_seg, audio_seg]).unwrap());
    }

    file
}

fn run_defragment(input: &[u8]) -> Vec<u8> {
    let mut src = Cursor::new(input.to_vec());
    let mut dst = Vec::new();
    defragment(
        &mut src,
        &mut dst,
        &TrackMetadata {
            copyright: Some("https://example.invalid/watch/sm9".into()),
            title: Some("title".into()),
            comment: None,
            date: Some("2024-01-01".into()),
        },
    )
    .unwrap();
    dst
}

#[test]
fn fragmented_input_becomes_progressive() {
    let input = staging_file(&[
        (
            vec![(b"vvvvvvvv".as_slice(), 100), (b"VVVV".as_slice(), 100)],
            vec![(b"aaaa".as_slice(), 100), (b"AA".as_slice(), 100)],
        ),
        (
            vec![(b"wwwwww".as_slice(), 100), (b"WW".as_slice(), 100)],
            vec![(b"bbb".as_slice(), 100), (b"B".as_slice(), 100)],
        ),
    ]);

    let output = run_defragment(&input);

    // ftyp leads the file.
    assert_eq!(&output[4..8], b"ftyp");

    let file = Mp4File::decode_bytes(&Bytes::from(output.clone())).unwrap();
    assert!(!file.is_fragmented());
    assert!(file.segments.is_empty());

    let moov = file.moov.expect("single moov");
    let traks = moov.traks();
    assert_eq!(traks.len(), 2);

    // mvhd runs at millisecond scale; 4 video samples of 100 ticks at
    // timescale 1000 give 400 ms.
    assert_eq!(moov.mvhd().unwrap().timescale, 1000);
    assert_eq!(moov.mvhd().unwrap().duration, 400);

    let video_stbl = traks[0].mdia().unwrap().minf().unwrap().stbl().unwrap();
    let audio_stbl = traks[1].mdia().unwrap().minf().unwrap().stbl().unwrap();

    // Sample sizes survive per track.
    assert_eq!(video_stbl.stsz().unwrap().sizes, vec![8, 4, 6, 2]);
    assert_eq!(audio_stbl.stsz().unwrap().sizes, vec![4, 2, 3, 1]);

    // Uniform durations collapse to a single run.
    assert_eq!(video_stbl.stts().unwrap().entries, vec![(4, 100)]);

    // Sync samples mark the two fragment boundaries.
    assert_eq!(video_stbl.stss().unwrap().sample_numbers, vec![1, 3]);
    assert!(audio_stbl.stss().is_none());

    // Video handler gets a ctts table, audio does not.
    assert!(video_stbl.ctts().is_some());
    assert!(audio_stbl.ctts().is_none());

    // One mdat, with every sample accounted for.
    let mdat = file.mdat.expect("single mdat");
    let stsz_total = video_stbl.stsz().unwrap().total() + audio_stbl.stsz().unwrap().total();
    assert!(stsz_total <= mdat.payload_len);
    assert_eq!(stsz_total, mdat.payload_len);

    // The first video chunk offset points at the first video sample.
    let first_chunk = video_stbl.stco().unwrap().chunk_offsets[0] as usize;
    assert_eq!(&output[first_chunk..first_chunk + 8], b"vvvvvvvv");

    // Interleaving alternates video and audio chunks.
    let first_audio_chunk = audio_stbl.stco().unwrap().chunk_offsets[0] as usize;
    assert_eq!(first_audio_chunk, first_chunk + 8);
    assert_eq!(&output[first_audio_chunk..first_audio_chunk + 4], b"aaaa");
}

#[test]
fn metadata_lands_in_udta() {
    let input = staging_file(&[(
        vec![(b"vv".as_slice(), 100)],
        vec![(b"aa".as_slice(), 100)],
    )]);

    let output = run_defragment(&input);

    let haystack = output.as_slice();
    let title_key = [0xa9, b'n', b'a', b'm'];
    assert!(haystack.windows(4).any(|w| w == b"udta"));
    assert!(haystack.windows(4).any(|w| w == b"ilst"));
    assert!(haystack.windows(4).any(|w| w == title_key));
    assert!(haystack.windows(5).any(|w| w == b"title"));
    // Entries without a value are omitted entirely.
    let comment_key = [0xa9, b'c', b'm', b't'];
    assert!(!haystack.windows(4).any(|w| w == comment_key));
}

#[test]
fn non_fragmented_input_is_copied_verbatim() {
    let mut input = Vec::new();
    Mp4Box::Ftyp(FtypBox::isom()).encode_into(&mut input);
    let mut moov = ContainerBox::new(b"moov");
    moov.push(Mp4Box::Mvhd(MvhdBox::default()));
    moov.encode_into(&mut input);
    input.extend_from_slice(&12u32.to_be_bytes());
    input.extend_from_slice(b"mdat");
    input.extend_from_slice(b"data");

    let output = run_defragment(&input);
    assert_eq!(output, input);
}

#[test]
fn resume_trailer_does_not_change_output() {
    let chunks = [(
        vec![(b"vvvv".as_slice(), 100)],
        vec![(b"aa".as_slice(), 100)],
    )];

    let clean = staging_file(&chunks);

    let mut with_trailer = clean.clone();
    with_trailer.extend_from_slice(&16u32.to_be_bytes());
    with_trailer.extend_from_slice(b"1919");
    with_trailer.extend_from_slice(&0u64.to_be_bytes());

    assert_eq!(run_defragment(&clean), run_defragment(&with_trailer));
}

#[test]
fn rewrite_is_deterministic() {
    let input = staging_file(&[
        (
            vec![(b"frame-one".as_slice(), 90), (b"frame-two".as_slice(), 110)],
            vec![(b"au1".as_slice(), 100), (b"au2".as_slice(), 100)],
        ),
        (
            vec![(b"frame-three".as_slice(), 100)],
            vec![(b"au3".as_slice(), 100)],
        ),
    ]);

    assert_eq!(run_defragment(&input), run_defragment(&input));
}
