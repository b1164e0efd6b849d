// File-level decoding: top-level box walk, fragment grouping, lazy mdat.

use std::io::{Read, Seek, SeekFrom};

use bytes::Bytes;

use crate::Mp4Error;
use crate::boxes::{ContainerBox, FtypBox, Mp4Box, SidxBox, StypBox, decode_children};
use crate::header::{BoxHeader, FourCC};

/// `mdat` payload location. The payload itself is only materialised for
/// in-memory sources; file sources keep the offsets and copy byte ranges
/// natively later.
#[derive(Debug, Clone)]
pub struct MdatBox {
    /// Absolute offset of the payload within the source.
    pub payload_offset: u64,
    pub payload_len: u64,
    /// Payload bytes for in-memory sources.
    pub data: Option<Bytes>,
}

/// One `moof`+`mdat` pair.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub moof: ContainerBox,
    /// Absolute offset of the `moof` box start within the source.
    pub moof_start: u64,
    pub mdat: MdatBox,
}

/// A run of fragments introduced by `styp`/`sidx` boxes.
#[derive(Debug, Clone, Default)]
pub struct SegmentBlock {
    pub styp: Option<StypBox>,
    pub sidxs: Vec<SidxBox>,
    pub fragments: Vec<Fragment>,
}

/// Decoded top-level view of an MP4 source.
///
/// Unknown top-level boxes are skipped; in particular the 16-byte resume
/// trailer a partially assembled download carries at EOF parses as an
/// unknown box and is ignored here.
#[derive(Debug, Clone, Default)]
pub struct Mp4File {
    pub ftyp: Option<FtypBox>,
    pub moov: Option<ContainerBox>,
    pub segments: Vec<SegmentBlock>,
    /// Top-level `mdat` of a progressive file.
    pub mdat: Option<MdatBox>,
}

enum Pending {
    None,
    Open(SegmentBlock),
}

impl Mp4File {
    pub fn is_fragmented(&self) -> bool {
        !self.segments.is_empty()
            || self
                .moov
                .as_ref()
                .is_some_and(|moov| moov.mvex().is_some())
    }

    /// Decodes from a seekable source without loading `mdat` payloads.
    pub fn decode_reader<R: Read + Seek>(r: &mut R) -> Result<Mp4File, Mp4Error> {
        let len = r.seek(SeekFrom::End(0))?;

        let mut file = Mp4File::default();
        let mut pending = Pending::None;
        let mut pos = 0u64;

        while pos + 8 <= len {
            r.seek(SeekFrom::Start(pos))?;

            let mut header_buf = [0u8; 16];
            let header_avail = (len - pos).min(16) as usize;
            r.read_exact(&mut header_buf[..header_avail])?;

            let Some(header) = BoxHeader::parse(&header_buf[..header_avail], len - pos)? else {
                break;
            };

            if pos + header.size > len {
                return Err(Mp4Error::parse(format!(
                    "box `{}` extends past end of file",
                    header.fourcc
                )));
            }

            let body_start = pos + header.header_len;
            let body_len = header.size - header.header_len;

            match &header.fourcc.0 {
                b"mdat" => {
                    let mdat = MdatBox {
                        payload_offset: body_start,
                        payload_len: body_len,
                        data: None,
                    };
                    file.place_mdat(&mut pending, mdat)?;
                }
                b"ftyp" | b"moov" | b"styp" | b"sidx" | b"moof" => {
                    r.seek(SeekFrom::Start(body_start))?;
                    let mut body = vec![0u8; body_len as usize];
                    r.read_exact(&mut body)?;

                    file.place_box(&mut pending, header.fourcc, Bytes::from(body), pos)?;
                }
                _ => {} // skip free/skip/trailer boxes
            }

            pos += header.size;
        }

        if let Pending::Open(block) = pending {
            file.segments.push(block);
        }

        Ok(file)
    }

    /// Decodes an in-memory source, keeping `mdat` payloads as zero-copy
    /// slices of `data`.
    pub fn decode_bytes(data: &Bytes) -> Result<Mp4File, Mp4Error> {
        let mut cursor = std::io::Cursor::new(data.as_ref());
        let mut file = Self::decode_reader(&mut cursor)?;

        let fill = |mdat: &mut MdatBox| {
            let start = mdat.payload_offset as usize;
            let end = start + mdat.payload_len as usize;
            mdat.data = Some(data.slice(start..end));
        };

        for segment in &mut file.segments {
            for fragment in &mut segment.fragments {
                fill(&mut fragment.mdat);
            }
        }

        if let Some(mdat) = &mut file.mdat {
            fill(mdat);
        }

        Ok(file)
    }

    fn place_mdat(&mut self, pending: &mut Pending, mdat: MdatBox) -> Result<(), Mp4Error> {
        if let Pending::Open(block) = pending {
            let Some(fragment) = block.fragments.last_mut() else {
                return Err(Mp4Error::parse("mdat before any moof in segment"));
            };

            if fragment.mdat.payload_len != 0 || fragment.mdat.payload_offset != 0 {
                return Err(Mp4Error::parse("fragment carries more than one mdat"));
            }

            fragment.mdat = mdat;
            return Ok(());
        }

        self.mdat = Some(mdat);
        Ok(())
    }

    fn place_box(
        &mut self,
        pending: &mut Pending,
        fourcc: FourCC,
        body: Bytes,
        box_start: u64,
    ) -> Result<(), Mp4Error> {
        match &fourcc.0 {
            b"ftyp" => {
                let Mp4Box::Ftyp(ftyp) = Mp4Box::decode(fourcc, body)? else {
                    unreachable!()
                };
                self.ftyp = Some(ftyp);
            }
            b"moov" => {
                let Mp4Box::Moov(moov) = Mp4Box::decode(fourcc, body)? else {
                    unreachable!()
                };
                self.moov = Some(moov);
            }
            b"styp" => {
                let Mp4Box::Styp(styp) = Mp4Box::decode(fourcc, body)? else {
                    unreachable!()
                };

                // styp always introduces a new segment.
                if let Pending::Open(block) = std::mem::replace(pending, Pending::None) {
                    self.segments.push(block);
                }
                *pending = Pending::Open(SegmentBlock {
                    styp: Some(styp),
                    ..SegmentBlock::default()
                });
            }
            b"sidx" => {
                let Mp4Box::Sidx(sidx) = Mp4Box::decode(fourcc, body)? else {
                    unreachable!()
                };

                // A sidx after fragments starts the next segment.
                let start_new = match pending {
                    Pending::None => true,
                    Pending::Open(block) => !block.fragments.is_empty(),
                };
                if start_new {
                    if let Pending::Open(block) = std::mem::replace(pending, Pending::None) {
                        self.segments.push(block);
                    }
                    *pending = Pending::Open(SegmentBlock::default());
                }

                let Pending::Open(block) = pending else {
                    unreachable!()
                };
                block.sidxs.push(sidx);
            }
            b"moof" => {
                let children = decode_children(&body)?;
                let moof = ContainerBox { fourcc, children };

                if matches!(pending, Pending::None) {
                    *pending = Pending::Open(SegmentBlock::default());
                }

                let Pending::Open(block) = pending else {
                    unreachable!()
                };
                block.fragments.push(Fragment {
                    moof,
                    moof_start: box_start,
                    mdat: MdatBox {
                        payload_offset: 0,
                        payload_len: 0,
                        data: None,
                    },
                });
            }
            _ => unreachable!(),
        }

        Ok(())
    }
}
