use std::sync::Arc;

use aes::Aes128;
use bytes::Bytes;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockEncryptMut, KeyIvInit};
use mp4box::{
    ContainerBox, FragmentBuilder, FtypBox, FullSample, HdlrBox, MdhdBox, Mp4Box, Mp4File,
    MvhdBox, RawBox, SidxBox, SidxRef, TkhdBox, TrexBox,
};
use progress::NullReport;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::*;
use crate::ClientConfig;

const KEY: [u8; 16] = [0x42; 16];
const IV_HEX: &str = "000102030405060708090a0b0c0d0e0f";

fn iv() -> [u8; 16] {
    let mut out = [0u8; 16];
    hex::decode_to_slice(IV_HEX, &mut out).unwrap();
    out
}

fn encrypt(plaintext: &[u8]) -> Vec<u8> {
    type Enc = cbc::Encryptor<Aes128>;

    let cipher = Enc::new(&KEY.into(), &iv().into());
    let padded_len = (plaintext.len() / 16 + 1) * 16;
    let mut buffer = vec![0u8; padded_len];
    buffer[..plaintext.len()].copy_from_slice(plaintext);

    let len = cipher
        .encrypt_padded_mut::<Pkcs7>(&mut buffer, plaintext.len())
        .unwrap()
        .len();
    buffer.truncate(len);
    buffer
}

fn init_segment(handler: &[u8; 4]) -> Vec<u8> {
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
        width: 0,
        height: 0,
    }));

    let mut stbl = ContainerBox::new(b"stbl");
    stbl.push(Mp4Box::Raw(RawBox {
        fourcc: mp4box::FourCC::new(b"stsd"),
        data: Bytes::from_static(&[0, 0, 0, 0, 0, 0, 0, 1]),
    }));

    let mut minf = ContainerBox::new(b"minf");
    minf.push(Mp4Box::Stbl(stbl));

    let mut mdia = ContainerBox::new(b"mdia");
    mdia.push(Mp4Box::Mdhd(MdhdBox {
        creation_time: 0,
        modification_time: 0,
        timescale: 1000,
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
    out
}

fn media_segment(payload: &[u8], sequence: u32) -> Vec<u8> {
    let mut builder = FragmentBuilder::new(sequence, &[1]);
    builder
        .add_sample(
            1,
            FullSample {
                duration: 100,
                size: payload.len() as u32,
                flags: 0x0200_0000,
                composition_time_offset: 0,
                data: Bytes::copy_from_slice(payload),
            },
        )
        .unwrap();

    let mut out = Vec::new();
    Mp4Box::Sidx(SidxBox {
        reference_id: 1,
        timescale: 1000,
        earliest_presentation_time: 0,
        first_offset: 0,
        references: vec![SidxRef {
            reference_type: false,
            referenced_size: 0,
            subsegment_duration: 100,
            starts_with_sap: true,
            sap_type: 1,
            sap_delta_time: 0,
        }],
    })
    .encode_into(&mut out);
    builder.encode_into(&mut out);
    out
}

fn media_playlist(prefix: &str) -> String {
    format!(
        "#EXTM3U\n\
#EXT-X-VERSION:6\n\
#EXT-X-TARGETDURATION:6\n\
#EXT-X-PLAYLIST-TYPE:VOD\n\
#EXT-X-MAP:URI=\"{prefix}-init.cmfv\"\n\
#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\",IV=0x{IV_HEX}\n\
#EXTINF:6.0,\n\
{prefix}-seg1.cmfv\n\
#EXTINF:6.0,\n\
{prefix}-seg2.cmfv\n\
#EXT-X-ENDLIST\n"
    )
}

fn master_playlist() -> String {
    "#EXTM3U\n\
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"audio\",NAME=\"Main\",DEFAULT=YES,URI=\"audio.m3u8\"\n\
#EXT-X-STREAM-INF:BANDWIDTH=2000000,AVERAGE-BANDWIDTH=1600000,AUDIO=\"audio\"\n\
video.m3u8\n"
        .to_owned()
}

async fn mount_text(server: &MockServer, route: &str, body: String, content_type: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(body.into_bytes(), content_type),
        )
        .mount(server)
        .await;
}

async fn mount_bytes(server: &MockServer, route: &str, body: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(server)
        .await;
}

/// Mounts everything except `/video-seg2.cmfv` which the caller controls.
async fn mount_common(server: &MockServer) {
    let master = master_playlist();
    let content_url = format!("{}/master.m3u8", server.uri());

    Mock::given(method("POST"))
        .and(path("/v1/watch/sm9/access-rights/hls"))
        .and(header("x-access-right-key", "ark-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": {"contentUrl": content_url}
        })))
        .mount(server)
        .await;

    mount_text(server, "/master.m3u8", master, "application/vnd.apple.mpegurl").await;
    mount_text(
        server,
        "/video.m3u8",
        media_playlist("video"),
        "application/vnd.apple.mpegurl",
    )
    .await;
    mount_text(
        server,
        "/audio.m3u8",
        media_playlist("audio"),
        "application/vnd.apple.mpegurl",
    )
    .await;

    mount_bytes(server, "/key.bin", KEY.to_vec()).await;

    mount_bytes(server, "/video-init.cmfv", init_segment(b"vide")).await;
    mount_bytes(server, "/audio-init.cmfv", init_segment(b"soun")).await;

    mount_bytes(
        server,
        "/video-seg1.cmfv",
        encrypt(&media_segment(b"video-frame-one", 1)),
    )
    .await;
    mount_bytes(
        server,
        "/audio-seg1.cmfv",
        encrypt(&media_segment(b"audio-one", 1)),
    )
    .await;
    mount_bytes(
        server,
        "/audio-seg2.cmfv",
        encrypt(&media_segment(b"audio-two", 2)),
    )
    .await;
}

fn client_for(server: &MockServer) -> Client {
    Client::new(ClientConfig {
        watch_api_base: server.uri(),
        ..ClientConfig::default()
    })
    .unwrap()
}

fn api_data() -> ApiData {
    let mut data = ApiData::default();
    data.client.watch_id = "sm9".into();
    data.client.watch_track_id = "track-1".into();
    data.media.domand.access_right_key = "ark-1".into();
    data.media.domand.videos.push(Default::default());
    data
}

async fn run(client: &Client, file_path: &std::path::Path) -> Result<(), NicoError> {
    let mut file = tokio::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(file_path)
        .await
        .unwrap();

    let token = CancellationToken::new();
    let reporter: Reporter = Arc::new(NullReport);

    download_dms(
        client,
        &mut file,
        file_path,
        &api_data(),
        "audio-aac",
        "video-h264",
        320,
        &token,
        &reporter,
    )
    .await
}

fn assert_staging_shape(staging: &[u8]) {
    let file = Mp4File::decode_bytes(&Bytes::copy_from_slice(staging)).unwrap();

    let moov = file.moov.expect("combined init moov");
    assert_eq!(moov.traks().len(), 2);
    assert_eq!(file.segments.len(), 2);

    for segment in &file.segments {
        // One renumbered sidx per stream, one combined two-track fragment.
        assert_eq!(segment.sidxs.len(), 2);
        assert_eq!(segment.sidxs[0].reference_id, 1);
        assert_eq!(segment.sidxs[1].reference_id, 2);
        assert_eq!(segment.fragments[0].moof.trafs().len(), 2);
    }

    // The trailer marks the last chunk (init + two media chunks = index 2).
    let trailer = &staging[staging.len() - 16..];
    assert_eq!(&trailer[0..4], &16u32.to_be_bytes());
    assert_eq!(&trailer[4..8], b"1919");
    assert_eq!(&trailer[8..16], &2u64.to_be_bytes());
}

#[tokio::test]
async fn full_download_combines_chunks() {
    let server = MockServer::start().await;
    mount_common(&server).await;
    mount_bytes(
        &server,
        "/video-seg2.cmfv",
        encrypt(&media_segment(b"video-frame-two", 2)),
    )
    .await;

    let dir = tempfile::tempdir().unwrap();
    let staging_path = dir.path().join("sm9.mp4.part");

    run(&client_for(&server), &staging_path).await.unwrap();

    let staging = std::fs::read(&staging_path).unwrap();
    assert_staging_shape(&staging);
}

#[tokio::test]
async fn interrupted_download_resumes_at_next_chunk() {
    let server = MockServer::start().await;
    mount_common(&server).await;

    // First run: the second video segment is missing.
    let dir = tempfile::tempdir().unwrap();
    let staging_path = dir.path().join("sm9.mp4.part");
    {
        let broken = Mock::given(method("GET"))
            .and(path("/video-seg2.cmfv"))
            .respond_with(ResponseTemplate::new(404));
        let _guard = server.register_as_scoped(broken).await;

        let err = run(&client_for(&server), &staging_path).await.unwrap_err();
        assert!(matches!(err, NicoError::Network { .. }));

        // The trailer records the last complete chunk.
        let staging = std::fs::read(&staging_path).unwrap();
        assert_eq!(&staging[staging.len() - 8..], &1u64.to_be_bytes());
    }

    {
        // Second run with the segment available: picks up at chunk 2.
        mount_bytes(
            &server,
            "/video-seg2.cmfv",
            encrypt(&media_segment(b"video-frame-two", 2)),
        )
        .await;

        run(&client_for(&server), &staging_path).await.unwrap();

        let resumed = std::fs::read(&staging_path).unwrap();
        assert_staging_shape(&resumed);

        // Chunks completed before the interruption were fetched once.
        let requests = server.received_requests().await.unwrap();
        let count = |p: &str| {
            requests
                .iter()
                .filter(|r| r.url.path() == p)
                .count()
        };
        assert_eq!(count("/video-init.cmfv"), 1);
        assert_eq!(count("/video-seg1.cmfv"), 1);
        assert_eq!(count("/audio-seg1.cmfv"), 1);

        // The resumed file is byte-identical to an uninterrupted run.
        let clean_server = MockServer::start().await;
        mount_common(&clean_server).await;
        mount_bytes(
            &clean_server,
            "/video-seg2.cmfv",
            encrypt(&media_segment(b"video-frame-two", 2)),
        )
        .await;

        let clean_dir = tempfile::tempdir().unwrap();
        let clean_path = clean_dir.path().join("sm9.mp4.part");
        run(&client_for(&clean_server), &clean_path).await.unwrap();

        assert_eq!(resumed, std::fs::read(&clean_path).unwrap());
    }
}

#[tokio::test]
async fn uneven_streams_are_rejected() {
    let server = MockServer::start().await;

    let content_url = format!("{}/master.m3u8", server.uri());
    Mock::given(method("POST"))
        .and(path("/v1/watch/sm9/access-rights/hls"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": {"contentUrl": content_url}
        })))
        .mount(&server)
        .await;

    mount_text(
        &server,
        "/master.m3u8",
        master_playlist(),
        "application/vnd.apple.mpegurl",
    )
    .await;
    mount_text(
        &server,
        "/video.m3u8",
        media_playlist("video"),
        "application/vnd.apple.mpegurl",
    )
    .await;

    // Audio playlist with one fewer segment.
    let short_audio = "#EXTM3U\n\
#EXT-X-VERSION:6\n\
#EXT-X-TARGETDURATION:6\n\
#EXT-X-MAP:URI=\"audio-init.cmfv\"\n\
#EXTINF:6.0,\n\
audio-seg1.cmfv\n\
#EXT-X-ENDLIST\n";
    mount_text(
        &server,
        "/audio.m3u8",
        short_audio.to_owned(),
        "application/vnd.apple.mpegurl",
    )
    .await;

    let dir = tempfile::tempdir().unwrap();
    let staging_path = dir.path().join("sm9.mp4.part");

    let err = run(&client_for(&server), &staging_path).await.unwrap_err();
    assert!(matches!(
        err,
        NicoError::UnevenStreams { audio: 2, video: 3 }
    ));
}
