// Typed boxes and the generic container tree.
//
// Containers hold an ordered `Vec<Mp4Box>` so unknown children survive a
// decode/encode round trip; typed accessors expose the children the
// pipeline reads or mutates.

use bytes::Bytes;
use byteorder::{BigEndian, ByteOrder};

use crate::Mp4Error;
use crate::header::{BoxHeader, FourCC, begin_box, end_box, full_box, put_full_box};

// tfhd flags
pub const TFHD_BASE_DATA_OFFSET: u32 = 0x000001;
pub const TFHD_SAMPLE_DESCRIPTION_INDEX: u32 = 0x000002;
pub const TFHD_DEFAULT_SAMPLE_DURATION: u32 = 0x000008;
pub const TFHD_DEFAULT_SAMPLE_SIZE: u32 = 0x000010;
pub const TFHD_DEFAULT_SAMPLE_FLAGS: u32 = 0x000020;
pub const TFHD_DEFAULT_BASE_IS_MOOF: u32 = 0x020000;

// trun flags
pub const TRUN_DATA_OFFSET: u32 = 0x000001;
pub const TRUN_FIRST_SAMPLE_FLAGS: u32 = 0x000004;
pub const TRUN_SAMPLE_DURATION: u32 = 0x000100;
pub const TRUN_SAMPLE_SIZE: u32 = 0x000200;
pub const TRUN_SAMPLE_FLAGS: u32 = 0x000400;
pub const TRUN_SAMPLE_CTO: u32 = 0x000800;

/// Any box in the tree.
#[derive(Debug, Clone)]
pub enum Mp4Box {
    Ftyp(FtypBox),
    Styp(StypBox),
    Moov(ContainerBox),
    Mvhd(MvhdBox),
    Trak(ContainerBox),
    Tkhd(TkhdBox),
    Edts(ContainerBox),
    Elst(ElstBox),
    Mdia(ContainerBox),
    Mdhd(MdhdBox),
    Hdlr(HdlrBox),
    Minf(ContainerBox),
    Stbl(ContainerBox),
    Stts(SttsBox),
    Stss(StssBox),
    Ctts(CttsBox),
    Stsc(StscBox),
    Stsz(StszBox),
    Stco(StcoBox),
    Udta(ContainerBox),
    Meta(MetaBox),
    Ilst(IlstBox),
    Mvex(ContainerBox),
    Trex(TrexBox),
    Mehd(MehdBox),
    Mfhd(MfhdBox),
    Traf(ContainerBox),
    Tfhd(TfhdBox),
    Tfdt(TfdtBox),
    Trun(TrunBox),
    Sidx(SidxBox),
    Raw(RawBox),
}

const CONTAINER_KINDS: &[&[u8; 4]] = &[
    b"moov", b"trak", b"edts", b"mdia", b"minf", b"stbl", b"udta", b"mvex", b"traf",
];

impl Mp4Box {
    pub fn fourcc(&self) -> FourCC {
        match self {
            Mp4Box::Ftyp(_) => FourCC::new(b"ftyp"),
            Mp4Box::Styp(_) => FourCC::new(b"styp"),
            Mp4Box::Mvhd(_) => FourCC::new(b"mvhd"),
            Mp4Box::Tkhd(_) => FourCC::new(b"tkhd"),
            Mp4Box::Elst(_) => FourCC::new(b"elst"),
            Mp4Box::Mdhd(_) => FourCC::new(b"mdhd"),
            Mp4Box::Hdlr(_) => FourCC::new(b"hdlr"),
            Mp4Box::Stts(_) => FourCC::new(b"stts"),
            Mp4Box::Stss(_) => FourCC::new(b"stss"),
            Mp4Box::Ctts(_) => FourCC::new(b"ctts"),
            Mp4Box::Stsc(_) => FourCC::new(b"stsc"),
            Mp4Box::Stsz(_) => FourCC::new(b"stsz"),
            Mp4Box::Stco(_) => FourCC::new(b"stco"),
            Mp4Box::Meta(_) => FourCC::new(b"meta"),
            Mp4Box::Ilst(_) => FourCC::new(b"ilst"),
            Mp4Box::Trex(_) => FourCC::new(b"trex"),
            Mp4Box::Mehd(_) => FourCC::new(b"mehd"),
            Mp4Box::Mfhd(_) => FourCC::new(b"mfhd"),
            Mp4Box::Tfhd(_) => FourCC::new(b"tfhd"),
            Mp4Box::Tfdt(_) => FourCC::new(b"tfdt"),
            Mp4Box::Trun(_) => FourCC::new(b"trun"),
            Mp4Box::Sidx(_) => FourCC::new(b"sidx"),
            Mp4Box::Moov(b)
            | Mp4Box::Trak(b)
            | Mp4Box::Edts(b)
            | Mp4Box::Mdia(b)
            | Mp4Box::Minf(b)
            | Mp4Box::Stbl(b)
            | Mp4Box::Udta(b)
            | Mp4Box::Mvex(b)
            | Mp4Box::Traf(b) => b.fourcc,
            Mp4Box::Raw(raw) => raw.fourcc,
        }
    }

    /// Decodes one box body. `moof` bodies are handled here too; `mdat` is
    /// handled at the file layer where payload laziness matters.
    pub fn decode(fourcc: FourCC, body: Bytes) -> Result<Mp4Box, Mp4Error> {
        let parsed = match &fourcc.0 {
            b"ftyp" => Mp4Box::Ftyp(FtypBox::decode(&body)?),
            b"styp" => Mp4Box::Styp(StypBox(FtypBox::decode(&body)?)),
            b"mvhd" => Mp4Box::Mvhd(MvhdBox::decode(&body)?),
            b"tkhd" => Mp4Box::Tkhd(TkhdBox::decode(&body)?),
            b"elst" => Mp4Box::Elst(ElstBox::decode(&body)?),
            b"mdhd" => Mp4Box::Mdhd(MdhdBox::decode(&body)?),
            b"hdlr" => Mp4Box::Hdlr(HdlrBox::decode(&body)?),
            b"stts" => Mp4Box::Stts(SttsBox::decode(&body)?),
            b"stss" => Mp4Box::Stss(StssBox::decode(&body)?),
            b"ctts" => Mp4Box::Ctts(CttsBox::decode(&body)?),
            b"stsc" => Mp4Box::Stsc(StscBox::decode(&body)?),
            b"stsz" => Mp4Box::Stsz(StszBox::decode(&body)?),
            b"stco" => Mp4Box::Stco(StcoBox::decode(&body)?),
            b"trex" => Mp4Box::Trex(TrexBox::decode(&body)?),
            b"mehd" => Mp4Box::Mehd(MehdBox::decode(&body)?),
            b"mfhd" => Mp4Box::Mfhd(MfhdBox::decode(&body)?),
            b"tfhd" => Mp4Box::Tfhd(TfhdBox::decode(&body)?),
            b"tfdt" => Mp4Box::Tfdt(TfdtBox::decode(&body)?),
            b"trun" => Mp4Box::Trun(TrunBox::decode(&body)?),
            b"sidx" => Mp4Box::Sidx(SidxBox::decode(&body)?),
            b"meta" => Mp4Box::Meta(MetaBox::decode(&body)?),
            kind if CONTAINER_KINDS.contains(&kind) => {
                let children = decode_children(&body)?;
                let container = ContainerBox { fourcc, children };
                match kind {
                    b"moov" => Mp4Box::Moov(container),
                    b"trak" => Mp4Box::Trak(container),
                    b"edts" => Mp4Box::Edts(container),
                    b"mdia" => Mp4Box::Mdia(container),
                    b"minf" => Mp4Box::Minf(container),
                    b"stbl" => Mp4Box::Stbl(container),
                    b"udta" => Mp4Box::Udta(container),
                    b"mvex" => Mp4Box::Mvex(container),
                    _ => Mp4Box::Traf(container),
                }
            }
            _ => Mp4Box::Raw(RawBox {
                fourcc,
                data: body,
            }),
        };

        Ok(parsed)
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let start = begin_box(out, self.fourcc());

        match self {
            Mp4Box::Ftyp(b) => b.encode_body(out),
            Mp4Box::Styp(b) => b.0.encode_body(out),
            Mp4Box::Mvhd(b) => b.encode_body(out),
            Mp4Box::Tkhd(b) => b.encode_body(out),
            Mp4Box::Elst(b) => b.encode_body(out),
            Mp4Box::Mdhd(b) => b.encode_body(out),
            Mp4Box::Hdlr(b) => b.encode_body(out),
            Mp4Box::Stts(b) => b.encode_body(out),
            Mp4Box::Stss(b) => b.encode_body(out),
            Mp4Box::Ctts(b) => b.encode_body(out),
            Mp4Box::Stsc(b) => b.encode_body(out),
            Mp4Box::Stsz(b) => b.encode_body(out),
            Mp4Box::Stco(b) => b.encode_body(out),
            Mp4Box::Trex(b) => b.encode_body(out),
            Mp4Box::Mehd(b) => b.encode_body(out),
            Mp4Box::Mfhd(b) => b.encode_body(out),
            Mp4Box::Tfhd(b) => b.encode_body(out),
            Mp4Box::Tfdt(b) => b.encode_body(out),
            Mp4Box::Trun(b) => b.encode_body(out),
            Mp4Box::Sidx(b) => b.encode_body(out),
            Mp4Box::Meta(b) => b.encode_body(out),
            Mp4Box::Ilst(b) => b.encode_body(out),
            Mp4Box::Moov(b)
            | Mp4Box::Trak(b)
            | Mp4Box::Edts(b)
            | Mp4Box::Mdia(b)
            | Mp4Box::Minf(b)
            | Mp4Box::Stbl(b)
            | Mp4Box::Udta(b)
            | Mp4Box::Mvex(b)
            | Mp4Box::Traf(b) => b.encode_children(out),
            Mp4Box::Raw(b) => out.extend_from_slice(&b.data),
        }

        end_box(out, start);
    }

    pub fn encoded_len(&self) -> u64 {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf.len() as u64
    }
}

/// Walks sibling boxes inside a container body.
pub(crate) fn decode_children(body: &Bytes) -> Result<Vec<Mp4Box>, Mp4Error> {
    let mut children = Vec::new();
    let mut offset = 0usize;

    while offset < body.len() {
        let remaining = (body.len() - offset) as u64;
        let Some(header) = BoxHeader::parse(&body[offset..], remaining)? else {
            break;
        };

        if header.size > remaining {
            return Err(Mp4Error::parse(format!(
                "box `{}` overruns its container",
                header.fourcc
            )));
        }

        let body_start = offset + header.header_len as usize;
        let body_end = offset + header.size as usize;
        children.push(Mp4Box::decode(header.fourcc, body.slice(body_start..body_end))?);

        offset = body_end;
    }

    Ok(children)
}

/// Generic container: ordered children with typed accessors.
#[derive(Debug, Clone)]
pub struct ContainerBox {
    pub fourcc: FourCC,
    pub children: Vec<Mp4Box>,
}

macro_rules! child {
    ($name:ident, $name_mut:ident, $variant:ident, $ty:ty) => {
        pub fn $name(&self) -> Option<&$ty> {
            self.children.iter().find_map(|c| match c {
                Mp4Box::$variant(b) => Some(b),
                _ => None,
            })
        }

        pub fn $name_mut(&mut self) -> Option<&mut $ty> {
            self.children.iter_mut().find_map(|c| match c {
                Mp4Box::$variant(b) => Some(b),
                _ => None,
            })
        }
    };
}

macro_rules! children {
    ($name:ident, $name_mut:ident, $variant:ident, $ty:ty) => {
        pub fn $name(&self) -> Vec<&$ty> {
            self.children
                .iter()
                .filter_map(|c| match c {
                    Mp4Box::$variant(b) => Some(b),
                    _ => None,
                })
                .collect()
        }

        pub fn $name_mut(&mut self) -> Vec<&mut $ty> {
            self.children
                .iter_mut()
                .filter_map(|c| match c {
                    Mp4Box::$variant(b) => Some(b),
                    _ => None,
                })
                .collect()
        }
    };
}

impl ContainerBox {
    pub fn new(fourcc: &[u8; 4]) -> Self {
        ContainerBox {
            fourcc: FourCC::new(fourcc),
            children: Vec::new(),
        }
    }

    pub fn push(&mut self, child: Mp4Box) {
        self.children.push(child);
    }

    /// Encodes this container as a standalone box.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let start = begin_box(out, self.fourcc);
        self.encode_children(out);
        end_box(out, start);
    }

    pub fn encoded_len(&self) -> u64 {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf.len() as u64
    }

    fn encode_children(&self, out: &mut Vec<u8>) {
        for child in &self.children {
            child.encode_into(out);
        }
    }

    // moov
    child!(mvhd, mvhd_mut, Mvhd, MvhdBox);
    child!(mvex, mvex_mut, Mvex, ContainerBox);
    children!(traks, traks_mut, Trak, ContainerBox);

    // trak
    child!(tkhd, tkhd_mut, Tkhd, TkhdBox);
    child!(edts, edts_mut, Edts, ContainerBox);
    child!(mdia, mdia_mut, Mdia, ContainerBox);

    // edts
    child!(elst, elst_mut, Elst, ElstBox);

    // mdia
    child!(mdhd, mdhd_mut, Mdhd, MdhdBox);
    child!(hdlr, hdlr_mut, Hdlr, HdlrBox);
    child!(minf, minf_mut, Minf, ContainerBox);

    // minf
    child!(stbl, stbl_mut, Stbl, ContainerBox);

    // stbl
    child!(stts, stts_mut, Stts, SttsBox);
    child!(stss, stss_mut, Stss, StssBox);
    child!(ctts, ctts_mut, Ctts, CttsBox);
    child!(stsc, stsc_mut, Stsc, StscBox);
    child!(stsz, stsz_mut, Stsz, StszBox);
    child!(stco, stco_mut, Stco, StcoBox);

    // mvex
    children!(trexs, trexs_mut, Trex, TrexBox);
    child!(mehd, mehd_mut, Mehd, MehdBox);

    // moof-family (the moof itself is modelled at the file layer)
    child!(mfhd, mfhd_mut, Mfhd, MfhdBox);
    children!(trafs, trafs_mut, Traf, ContainerBox);

    // traf
    child!(tfhd, tfhd_mut, Tfhd, TfhdBox);
    child!(tfdt, tfdt_mut, Tfdt, TfdtBox);
    children!(truns, truns_mut, Trun, TrunBox);
}

#[derive(Debug, Clone)]
pub struct RawBox {
    pub fourcc: FourCC,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub struct FtypBox {
    pub major_brand: FourCC,
    pub minor_version: u32,
    pub compatible_brands: Vec<FourCC>,
}

impl FtypBox {
    pub fn isom() -> Self {
        FtypBox {
            major_brand: FourCC::new(b"isom"),
            minor_version: 512,
            compatible_brands: [b"isom", b"iso2", b"avc1", b"mp41"]
                .iter()
                .map(|b| FourCC::new(b))
                .collect(),
        }
    }

    fn decode(body: &Bytes) -> Result<Self, Mp4Error> {
        if body.len() < 8 {
            return Err(Mp4Error::parse("ftyp too short"));
        }

        let major_brand = FourCC([body[0], body[1], body[2], body[3]]);
        let minor_version = BigEndian::read_u32(&body[4..8]);
        let compatible_brands = body[8..]
            .chunks_exact(4)
            .map(|c| FourCC([c[0], c[1], c[2], c[3]]))
            .collect();

        Ok(FtypBox {
            major_brand,
            minor_version,
            compatible_brands,
        })
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.major_brand.0);
        out.extend_from_slice(&self.minor_version.to_be_bytes());
        for brand in &self.compatible_brands {
            out.extend_from_slice(&brand.0);
        }
    }
}

#[derive(Debug, Clone)]
pub struct StypBox(pub FtypBox);

#[derive(Debug, Clone)]
pub struct MvhdBox {
    pub creation_time: u64,
    pub modification_time: u64,
    pub timescale: u32,
    pub duration: u64,
    pub rate: u32,
    pub volume: u16,
    pub matrix: [u8; 36],
    pub next_track_id: u32,
}

const UNITY_MATRIX: [u8; 36] = {
    let mut m = [0u8; 36];
    m[1] = 0x01; // 0x00010000
    m[17] = 0x01;
    m[32] = 0x40; // 0x40000000
    m
};

impl Default for MvhdBox {
    fn default() -> Self {
        MvhdBox {
            creation_time: 0,
            modification_time: 0,
            timescale: 1000,
            duration: 0,
            rate: 0x0001_0000,
            volume: 0x0100,
            matrix: UNITY_MATRIX,
            next_track_id: 0xffff_ffff,
        }
    }
}

fn fits_u32(values: &[u64]) -> bool {
    values.iter().all(|&v| v <= u64::from(u32::MAX))
}

impl MvhdBox {
    fn decode(body: &Bytes) -> Result<Self, Mp4Error> {
        let (version, _, rest) = full_box(body)?;
        let mut r = Reader::new(rest);

        let (creation_time, modification_time, timescale, duration) = if version == 1 {
            (r.u64()?, r.u64()?, r.u32()?, r.u64()?)
        } else {
            (
                u64::from(r.u32()?),
                u64::from(r.u32()?),
                r.u32()?,
                u64::from(r.u32()?),
            )
        };

        let rate = r.u32()?;
        let volume = r.u16()?;
        r.skip(10)?; // reserved
        let matrix = r.array::<36>()?;
        r.skip(24)?; // pre_defined
        let next_track_id = r.u32()?;

        Ok(MvhdBox {
            creation_time,
            modification_time,
            timescale,
            duration,
            rate,
            volume,
            matrix,
            next_track_id,
        })
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        let compact = fits_u32(&[self.creation_time, self.modification_time, self.duration]);
        put_full_box(out, if compact { 0 } else { 1 }, 0);

        if compact {
            out.extend_from_slice(&(self.creation_time as u32).to_be_bytes());
            out.extend_from_slice(&(self.modification_time as u32).to_be_bytes());
            out.extend_from_slice(&self.timescale.to_be_bytes());
            out.extend_from_slice(&(self.duration as u32).to_be_bytes());
        } else {
            out.extend_from_slice(&self.creation_time.to_be_bytes());
            out.extend_from_slice(&self.modification_time.to_be_bytes());
            out.extend_from_slice(&self.timescale.to_be_bytes());
            out.extend_from_slice(&self.duration.to_be_bytes());
        }

        out.extend_from_slice(&self.rate.to_be_bytes());
        out.extend_from_slice(&self.volume.to_be_bytes());
        out.extend_from_slice(&[0u8; 10]);
        out.extend_from_slice(&self.matrix);
        out.extend_from_slice(&[0u8; 24]);
        out.extend_from_slice(&self.next_track_id.to_be_bytes());
    }
}

#[derive(Debug, Clone)]
pub struct TkhdBox {
    pub flags: u32,
    pub creation_time: u64,
    pub modification_time: u64,
    pub track_id: u32,
    pub duration: u64,
    pub layer: u16,
    pub alternate_group: u16,
    pub volume: u16,
    pub matrix: [u8; 36],
    /// 16.16 fixed point.
    pub width: u32,
    /// 16.16 fixed point.
    pub height: u32,
}

impl TkhdBox {
    fn decode(body: &Bytes) -> Result<Self, Mp4Error> {
        let (version, flags, rest) = full_box(body)?;
        let mut r = Reader::new(rest);

        let (creation_time, modification_time, track_id, duration) = if version == 1 {
            let c = r.u64()?;
            let m = r.u64()?;
            let id = r.u32()?;
            r.skip(4)?;
            (c, m, id, r.u64()?)
        } else {
            let c = u64::from(r.u32()?);
            let m = u64::from(r.u32()?);
            let id = r.u32()?;
            r.skip(4)?;
            (c, m, id, u64::from(r.u32()?))
        };

        r.skip(8)?; // reserved
        let layer = r.u16()?;
        let alternate_group = r.u16()?;
        let volume = r.u16()?;
        r.skip(2)?;
        let matrix = r.array::<36>()?;
        let width = r.u32()?;
        let height = r.u32()?;

        Ok(TkhdBox {
            flags,
            creation_time,
            modification_time,
            track_id,
            duration,
            layer,
            alternate_group,
            volume,
            matrix,
            width,
            height,
        })
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        let compact = fits_u32(&[self.creation_time, self.modification_time, self.duration]);
        put_full_box(out, if compact { 0 } else { 1 }, self.flags);

        if compact {
            out.extend_from_slice(&(self.creation_time as u32).to_be_bytes());
            out.extend_from_slice(&(self.modification_time as u32).to_be_bytes());
            out.extend_from_slice(&self.track_id.to_be_bytes());
            out.extend_from_slice(&[0u8; 4]);
            out.extend_from_slice(&(self.duration as u32).to_be_bytes());
        } else {
            out.extend_from_slice(&self.creation_time.to_be_bytes());
            out.extend_from_slice(&self.modification_time.to_be_bytes());
            out.extend_from_slice(&self.track_id.to_be_bytes());
            out.extend_from_slice(&[0u8; 4]);
            out.extend_from_slice(&self.duration.to_be_bytes());
        }

        out.extend_from_slice(&[0u8; 8]);
        out.extend_from_slice(&self.layer.to_be_bytes());
        out.extend_from_slice(&self.alternate_group.to_be_bytes());
        out.extend_from_slice(&self.volume.to_be_bytes());
        out.extend_from_slice(&[0u8; 2]);
        out.extend_from_slice(&self.matrix);
        out.extend_from_slice(&self.width.to_be_bytes());
        out.extend_from_slice(&self.height.to_be_bytes());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElstEntry {
    pub segment_duration: u64,
    pub media_time: i64,
    pub media_rate_integer: u16,
    pub media_rate_fraction: u16,
}

#[derive(Debug, Clone, Default)]
pub struct ElstBox {
    pub entries: Vec<ElstEntry>,
}

impl ElstBox {
    fn decode(body: &Bytes) -> Result<Self, Mp4Error> {
        let (version, _, rest) = full_box(body)?;
        let mut r = Reader::new(rest);
        let count = r.u32()?;
        let mut entries = Vec::with_capacity(count as usize);

        for _ in 0..count {
            let (segment_duration, media_time) = if version == 1 {
                (r.u64()?, r.u64()? as i64)
            } else {
                (u64::from(r.u32()?), i64::from(r.u32()? as i32))
            };

            entries.push(ElstEntry {
                segment_duration,
                media_time,
                media_rate_integer: r.u16()?,
                media_rate_fraction: r.u16()?,
            });
        }

        Ok(ElstBox { entries })
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        let compact = self.entries.iter().all(|e| {
            e.segment_duration <= u64::from(u32::MAX)
                && i64::from(e.media_time as i32) == e.media_time
        });
        put_full_box(out, if compact { 0 } else { 1 }, 0);
        out.extend_from_slice(&(self.entries.len() as u32).to_be_bytes());

        for e in &self.entries {
            if compact {
                out.extend_from_slice(&(e.segment_duration as u32).to_be_bytes());
                out.extend_from_slice(&(e.media_time as i32).to_be_bytes());
            } else {
                out.extend_from_slice(&e.segment_duration.to_be_bytes());
                out.extend_from_slice(&e.media_time.to_be_bytes());
            }
            out.extend_from_slice(&e.media_rate_integer.to_be_bytes());
            out.extend_from_slice(&e.media_rate_fraction.to_be_bytes());
        }
    }
}

#[derive(Debug, Clone)]
pub struct MdhdBox {
    pub creation_time: u64,
    pub modification_time: u64,
    pub timescale: u32,
    pub duration: u64,
    /// Packed ISO-639-2 language.
    pub language: u16,
}

impl MdhdBox {
    fn decode(body: &Bytes) -> Result<Self, Mp4Error> {
        let (version, _, rest) = full_box(body)?;
        let mut r = Reader::new(rest);

        let (creation_time, modification_time, timescale, duration) = if version == 1 {
            (r.u64()?, r.u64()?, r.u32()?, r.u64()?)
        } else {
            (
                u64::from(r.u32()?),
                u64::from(r.u32()?),
                r.u32()?,
                u64::from(r.u32()?),
            )
        };

        let language = r.u16()?;

        Ok(MdhdBox {
            creation_time,
            modification_time,
            timescale,
            duration,
            language,
        })
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        let compact = fits_u32(&[self.creation_time, self.modification_time, self.duration]);
        put_full_box(out, if compact { 0 } else { 1 }, 0);

        if compact {
            out.extend_from_slice(&(self.creation_time as u32).to_be_bytes());
            out.extend_from_slice(&(self.modification_time as u32).to_be_bytes());
            out.extend_from_slice(&self.timescale.to_be_bytes());
            out.extend_from_slice(&(self.duration as u32).to_be_bytes());
        } else {
            out.extend_from_slice(&self.creation_time.to_be_bytes());
            out.extend_from_slice(&self.modification_time.to_be_bytes());
            out.extend_from_slice(&self.timescale.to_be_bytes());
            out.extend_from_slice(&self.duration.to_be_bytes());
        }

        out.extend_from_slice(&self.language.to_be_bytes());
        out.extend_from_slice(&[0u8; 2]); // pre_defined
    }
}

#[derive(Debug, Clone)]
pub struct HdlrBox {
    pub handler_type: FourCC,
    pub name: String,
}

impl HdlrBox {
    pub fn new(handler_type: &[u8; 4]) -> Self {
        HdlrBox {
            handler_type: FourCC::new(handler_type),
            name: String::new(),
        }
    }

    pub fn is_video(&self) -> bool {
        self.handler_type == FourCC::new(b"vide")
    }

    fn decode(body: &Bytes) -> Result<Self, Mp4Error> {
        let (_, _, rest) = full_box(body)?;
        let mut r = Reader::new(rest);
        r.skip(4)?; // pre_defined
        let handler_type = FourCC(r.array::<4>()?);
        r.skip(12)?; // reserved

        let name = String::from_utf8_lossy(r.rest())
            .trim_end_matches('\0')
            .to_owned();

        Ok(HdlrBox { handler_type, name })
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        put_full_box(out, 0, 0);
        out.extend_from_slice(&[0u8; 4]);
        out.extend_from_slice(&self.handler_type.0);
        out.extend_from_slice(&[0u8; 12]);
        out.extend_from_slice(self.name.as_bytes());
        out.push(0);
    }
}

#[derive(Debug, Clone, Default)]
pub struct SttsBox {
    /// `(sample_count, sample_delta)` runs.
    pub entries: Vec<(u32, u32)>,
}

impl SttsBox {
    /// Appends one sample, merging into the previous run when the duration
    /// repeats.
    pub fn push_sample(&mut self, delta: u32) {
        match self.entries.last_mut() {
            Some((count, last)) if *last == delta => *count += 1,
            _ => self.entries.push((1, delta)),
        }
    }

    pub fn sample_count(&self) -> u64 {
        self.entries.iter().map(|(c, _)| u64::from(*c)).sum()
    }

    fn decode(body: &Bytes) -> Result<Self, Mp4Error> {
        let (_, _, rest) = full_box(body)?;
        let mut r = Reader::new(rest);
        let count = r.u32()?;
        let mut entries = Vec::with_capacity(count as usize);

        for _ in 0..count {
            entries.push((r.u32()?, r.u32()?));
        }

        Ok(SttsBox { entries })
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        put_full_box(out, 0, 0);
        out.extend_from_slice(&(self.entries.len() as u32).to_be_bytes());
        for (count, delta) in &self.entries {
            out.extend_from_slice(&count.to_be_bytes());
            out.extend_from_slice(&delta.to_be_bytes());
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StssBox {
    pub sample_numbers: Vec<u32>,
}

impl StssBox {
    fn decode(body: &Bytes) -> Result<Self, Mp4Error> {
        let (_, _, rest) = full_box(body)?;
        let mut r = Reader::new(rest);
        let count = r.u32()?;
        let mut sample_numbers = Vec::with_capacity(count as usize);

        for _ in 0..count {
            sample_numbers.push(r.u32()?);
        }

        Ok(StssBox { sample_numbers })
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        put_full_box(out, 0, 0);
        out.extend_from_slice(&(self.sample_numbers.len() as u32).to_be_bytes());
        for n in &self.sample_numbers {
            out.extend_from_slice(&n.to_be_bytes());
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CttsBox {
    /// `(sample_count, composition_offset)` runs.
    pub entries: Vec<(u32, i32)>,
}

impl CttsBox {
    pub fn push_sample(&mut self, offset: i32) {
        match self.entries.last_mut() {
            Some((count, last)) if *last == offset => *count += 1,
            _ => self.entries.push((1, offset)),
        }
    }

    fn decode(body: &Bytes) -> Result<Self, Mp4Error> {
        let (_, _, rest) = full_box(body)?;
        let mut r = Reader::new(rest);
        let count = r.u32()?;
        let mut entries = Vec::with_capacity(count as usize);

        for _ in 0..count {
            entries.push((r.u32()?, r.u32()? as i32));
        }

        Ok(CttsBox { entries })
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        // Version 1 carries signed offsets.
        let version = if self.entries.iter().any(|(_, o)| *o < 0) {
            1
        } else {
            0
        };
        put_full_box(out, version, 0);
        out.extend_from_slice(&(self.entries.len() as u32).to_be_bytes());
        for (count, offset) in &self.entries {
            out.extend_from_slice(&count.to_be_bytes());
            out.extend_from_slice(&offset.to_be_bytes());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StscEntry {
    pub first_chunk: u32,
    pub samples_per_chunk: u32,
    pub sample_description_index: u32,
}

#[derive(Debug, Clone, Default)]
pub struct StscBox {
    pub entries: Vec<StscEntry>,
}

impl StscBox {
    /// Appends a run starting at `first_chunk` unless the previous run
    /// already has the same samples-per-chunk.
    pub fn push_run(&mut self, first_chunk: u32, samples_per_chunk: u32) {
        if let Some(last) = self.entries.last()
            && last.samples_per_chunk == samples_per_chunk
        {
            return;
        }

        self.entries.push(StscEntry {
            first_chunk,
            samples_per_chunk,
            sample_description_index: 1,
        });
    }

    fn decode(body: &Bytes) -> Result<Self, Mp4Error> {
        let (_, _, rest) = full_box(body)?;
        let mut r = Reader::new(rest);
        let count = r.u32()?;
        let mut entries = Vec::with_capacity(count as usize);

        for _ in 0..count {
            entries.push(StscEntry {
                first_chunk: r.u32()?,
                samples_per_chunk: r.u32()?,
                sample_description_index: r.u32()?,
            });
        }

        Ok(StscBox { entries })
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        put_full_box(out, 0, 0);
        out.extend_from_slice(&(self.entries.len() as u32).to_be_bytes());
        for e in &self.entries {
            out.extend_from_slice(&e.first_chunk.to_be_bytes());
            out.extend_from_slice(&e.samples_per_chunk.to_be_bytes());
            out.extend_from_slice(&e.sample_description_index.to_be_bytes());
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StszBox {
    /// Uniform size, 0 when `sizes` carries per-sample values.
    pub sample_size: u32,
    pub sizes: Vec<u32>,
}

impl StszBox {
    pub fn push_sample(&mut self, size: u32) {
        self.sizes.push(size);
    }

    pub fn total(&self) -> u64 {
        self.sizes.iter().map(|&s| u64::from(s)).sum()
    }

    fn decode(body: &Bytes) -> Result<Self, Mp4Error> {
        let (_, _, rest) = full_box(body)?;
        let mut r = Reader::new(rest);
        let sample_size = r.u32()?;
        let count = r.u32()?;
        let mut sizes = Vec::new();

        if sample_size == 0 {
            sizes.reserve(count as usize);
            for _ in 0..count {
                sizes.push(r.u32()?);
            }
        }

        Ok(StszBox { sample_size, sizes })
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        put_full_box(out, 0, 0);
        out.extend_from_slice(&self.sample_size.to_be_bytes());
        out.extend_from_slice(&(self.sizes.len() as u32).to_be_bytes());
        if self.sample_size == 0 {
            for size in &self.sizes {
                out.extend_from_slice(&size.to_be_bytes());
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StcoBox {
    pub chunk_offsets: Vec<u32>,
}

impl StcoBox {
    fn decode(body: &Bytes) -> Result<Self, Mp4Error> {
        let (_, _, rest) = full_box(body)?;
        let mut r = Reader::new(rest);
        let count = r.u32()?;
        let mut chunk_offsets = Vec::with_capacity(count as usize);

        for _ in 0..count {
            chunk_offsets.push(r.u32()?);
        }

        Ok(StcoBox { chunk_offsets })
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        put_full_box(out, 0, 0);
        out.extend_from_slice(&(self.chunk_offsets.len() as u32).to_be_bytes());
        for offset in &self.chunk_offsets {
            out.extend_from_slice(&offset.to_be_bytes());
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrexBox {
    pub track_id: u32,
    pub default_sample_description_index: u32,
    pub default_sample_duration: u32,
    pub default_sample_size: u32,
    pub default_sample_flags: u32,
}

impl TrexBox {
    fn decode(body: &Bytes) -> Result<Self, Mp4Error> {
        let (_, _, rest) = full_box(body)?;
        let mut r = Reader::new(rest);

        Ok(TrexBox {
            track_id: r.u32()?,
            default_sample_description_index: r.u32()?,
            default_sample_duration: r.u32()?,
            default_sample_size: r.u32()?,
            default_sample_flags: r.u32()?,
        })
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        put_full_box(out, 0, 0);
        out.extend_from_slice(&self.track_id.to_be_bytes());
        out.extend_from_slice(&self.default_sample_description_index.to_be_bytes());
        out.extend_from_slice(&self.default_sample_duration.to_be_bytes());
        out.extend_from_slice(&self.default_sample_size.to_be_bytes());
        out.extend_from_slice(&self.default_sample_flags.to_be_bytes());
    }
}

#[derive(Debug, Clone)]
pub struct MehdBox {
    pub fragment_duration: u64,
}

impl MehdBox {
    fn decode(body: &Bytes) -> Result<Self, Mp4Error> {
        let (version, _, rest) = full_box(body)?;
        let mut r = Reader::new(rest);
        let fragment_duration = if version == 1 {
            r.u64()?
        } else {
            u64::from(r.u32()?)
        };

        Ok(MehdBox { fragment_duration })
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        if self.fragment_duration <= u64::from(u32::MAX) {
            put_full_box(out, 0, 0);
            out.extend_from_slice(&(self.fragment_duration as u32).to_be_bytes());
        } else {
            put_full_box(out, 1, 0);
            out.extend_from_slice(&self.fragment_duration.to_be_bytes());
        }
    }
}

#[derive(Debug, Clone)]
pub struct MfhdBox {
    pub sequence_number: u32,
}

impl MfhdBox {
    fn decode(body: &Bytes) -> Result<Self, Mp4Error> {
        let (_, _, rest) = full_box(body)?;
        let mut r = Reader::new(rest);

        Ok(MfhdBox {
            sequence_number: r.u32()?,
        })
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        put_full_box(out, 0, 0);
        out.extend_from_slice(&self.sequence_number.to_be_bytes());
    }
}

#[derive(Debug, Clone)]
pub struct TfhdBox {
    pub flags: u32,
    pub track_id: u32,
    pub base_data_offset: Option<u64>,
    pub sample_description_index: Option<u32>,
    pub default_sample_duration: Option<u32>,
    pub default_sample_size: Option<u32>,
    pub default_sample_flags: Option<u32>,
}

impl TfhdBox {
    pub fn default_base_is_moof(track_id: u32) -> Self {
        TfhdBox {
            flags: TFHD_DEFAULT_BASE_IS_MOOF,
            track_id,
            base_data_offset: None,
            sample_description_index: None,
            default_sample_duration: None,
            default_sample_size: None,
            default_sample_flags: None,
        }
    }

    pub fn has_base_data_offset(&self) -> bool {
        self.flags & TFHD_BASE_DATA_OFFSET != 0
    }

    pub fn is_default_base_moof(&self) -> bool {
        self.flags & TFHD_DEFAULT_BASE_IS_MOOF != 0
    }

    fn decode(body: &Bytes) -> Result<Self, Mp4Error> {
        let (_, flags, rest) = full_box(body)?;
        let mut r = Reader::new(rest);
        let track_id = r.u32()?;

        let base_data_offset = if flags & TFHD_BASE_DATA_OFFSET != 0 {
            Some(r.u64()?)
        } else {
            None
        };
        let sample_description_index = if flags & TFHD_SAMPLE_DESCRIPTION_INDEX != 0 {
            Some(r.u32()?)
        } else {
            None
        };
        let default_sample_duration = if flags & TFHD_DEFAULT_SAMPLE_DURATION != 0 {
            Some(r.u32()?)
        } else {
            None
        };
        let default_sample_size = if flags & TFHD_DEFAULT_SAMPLE_SIZE != 0 {
            Some(r.u32()?)
        } else {
            None
        };
        let default_sample_flags = if flags & TFHD_DEFAULT_SAMPLE_FLAGS != 0 {
            Some(r.u32()?)
        } else {
            None
        };

        Ok(TfhdBox {
            flags,
            track_id,
            base_data_offset,
            sample_description_index,
            default_sample_duration,
            default_sample_size,
            default_sample_flags,
        })
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        put_full_box(out, 0, self.flags);
        out.extend_from_slice(&self.track_id.to_be_bytes());

        if self.flags & TFHD_BASE_DATA_OFFSET != 0 {
            out.extend_from_slice(&self.base_data_offset.unwrap_or(0).to_be_bytes());
        }
        if self.flags & TFHD_SAMPLE_DESCRIPTION_INDEX != 0 {
            out.extend_from_slice(&self.sample_description_index.unwrap_or(1).to_be_bytes());
        }
        if self.flags & TFHD_DEFAULT_SAMPLE_DURATION != 0 {
            out.extend_from_slice(&self.default_sample_duration.unwrap_or(0).to_be_bytes());
        }
        if self.flags & TFHD_DEFAULT_SAMPLE_SIZE != 0 {
            out.extend_from_slice(&self.default_sample_size.unwrap_or(0).to_be_bytes());
        }
        if self.flags & TFHD_DEFAULT_SAMPLE_FLAGS != 0 {
            out.extend_from_slice(&self.default_sample_flags.unwrap_or(0).to_be_bytes());
        }
    }
}

#[derive(Debug, Clone)]
pub struct TfdtBox {
    pub base_media_decode_time: u64,
}

impl TfdtBox {
    fn decode(body: &Bytes) -> Result<Self, Mp4Error> {
        let (version, _, rest) = full_box(body)?;
        let mut r = Reader::new(rest);
        let base_media_decode_time = if version == 1 {
            r.u64()?
        } else {
            u64::from(r.u32()?)
        };

        Ok(TfdtBox {
            base_media_decode_time,
        })
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        put_full_box(out, 1, 0);
        out.extend_from_slice(&self.base_media_decode_time.to_be_bytes());
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrunSample {
    pub duration: Option<u32>,
    pub size: Option<u32>,
    pub flags: Option<u32>,
    pub composition_time_offset: Option<i32>,
}

#[derive(Debug, Clone, Default)]
pub struct TrunBox {
    pub flags: u32,
    pub data_offset: Option<i32>,
    pub first_sample_flags: Option<u32>,
    pub samples: Vec<TrunSample>,
}

impl TrunBox {
    fn decode(body: &Bytes) -> Result<Self, Mp4Error> {
        let (_version, flags, rest) = full_box(body)?;
        let mut r = Reader::new(rest);
        let count = r.u32()?;

        let data_offset = if flags & TRUN_DATA_OFFSET != 0 {
            Some(r.u32()? as i32)
        } else {
            None
        };
        let first_sample_flags = if flags & TRUN_FIRST_SAMPLE_FLAGS != 0 {
            Some(r.u32()?)
        } else {
            None
        };

        let mut samples = Vec::with_capacity(count as usize);

        for _ in 0..count {
            let duration = if flags & TRUN_SAMPLE_DURATION != 0 {
                Some(r.u32()?)
            } else {
                None
            };
            let size = if flags & TRUN_SAMPLE_SIZE != 0 {
                Some(r.u32()?)
            } else {
                None
            };
            let sample_flags = if flags & TRUN_SAMPLE_FLAGS != 0 {
                Some(r.u32()?)
            } else {
                None
            };
            // Version 0 offsets are unsigned but fit i32 in practice;
            // version 1 offsets are signed. Both reinterpret the same word.
            let composition_time_offset = if flags & TRUN_SAMPLE_CTO != 0 {
                Some(r.u32()? as i32)
            } else {
                None
            };

            samples.push(TrunSample {
                duration,
                size,
                flags: sample_flags,
                composition_time_offset,
            });
        }

        Ok(TrunBox {
            flags,
            data_offset,
            first_sample_flags,
            samples,
        })
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        let signed_cto = self
            .samples
            .iter()
            .any(|s| s.composition_time_offset.unwrap_or(0) < 0);
        put_full_box(out, if signed_cto { 1 } else { 0 }, self.flags);
        out.extend_from_slice(&(self.samples.len() as u32).to_be_bytes());

        if self.flags & TRUN_DATA_OFFSET != 0 {
            out.extend_from_slice(&self.data_offset.unwrap_or(0).to_be_bytes());
        }
        if self.flags & TRUN_FIRST_SAMPLE_FLAGS != 0 {
            out.extend_from_slice(&self.first_sample_flags.unwrap_or(0).to_be_bytes());
        }

        for s in &self.samples {
            if self.flags & TRUN_SAMPLE_DURATION != 0 {
                out.extend_from_slice(&s.duration.unwrap_or(0).to_be_bytes());
            }
            if self.flags & TRUN_SAMPLE_SIZE != 0 {
                out.extend_from_slice(&s.size.unwrap_or(0).to_be_bytes());
            }
            if self.flags & TRUN_SAMPLE_FLAGS != 0 {
                out.extend_from_slice(&s.flags.unwrap_or(0).to_be_bytes());
            }
            if self.flags & TRUN_SAMPLE_CTO != 0 {
                out.extend_from_slice(&s.composition_time_offset.unwrap_or(0).to_be_bytes());
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SidxRef {
    pub reference_type: bool,
    pub referenced_size: u32,
    pub subsegment_duration: u32,
    pub starts_with_sap: bool,
    pub sap_type: u8,
    pub sap_delta_time: u32,
}

#[derive(Debug, Clone)]
pub struct SidxBox {
    pub reference_id: u32,
    pub timescale: u32,
    pub earliest_presentation_time: u64,
    pub first_offset: u64,
    pub references: Vec<SidxRef>,
}

impl SidxBox {
    fn decode(body: &Bytes) -> Result<Self, Mp4Error> {
        let (version, _, rest) = full_box(body)?;
        let mut r = Reader::new(rest);
        let reference_id = r.u32()?;
        let timescale = r.u32()?;

        let (earliest_presentation_time, first_offset) = if version == 1 {
            (r.u64()?, r.u64()?)
        } else {
            (u64::from(r.u32()?), u64::from(r.u32()?))
        };

        r.skip(2)?; // reserved
        let count = r.u16()?;
        let mut references = Vec::with_capacity(count as usize);

        for _ in 0..count {
            let word = r.u32()?;
            let subsegment_duration = r.u32()?;
            let sap = r.u32()?;

            references.push(SidxRef {
                reference_type: word & 0x8000_0000 != 0,
                referenced_size: word & 0x7fff_ffff,
                subsegment_duration,
                starts_with_sap: sap & 0x8000_0000 != 0,
                sap_type: ((sap >> 28) & 0x7) as u8,
                sap_delta_time: sap & 0x0fff_ffff,
            });
        }

        Ok(SidxBox {
            reference_id,
            timescale,
            earliest_presentation_time,
            first_offset,
            references,
        })
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        let compact = fits_u32(&[self.earliest_presentation_time, self.first_offset]);
        put_full_box(out, if compact { 0 } else { 1 }, 0);
        out.extend_from_slice(&self.reference_id.to_be_bytes());
        out.extend_from_slice(&self.timescale.to_be_bytes());

        if compact {
            out.extend_from_slice(&(self.earliest_presentation_time as u32).to_be_bytes());
            out.extend_from_slice(&(self.first_offset as u32).to_be_bytes());
        } else {
            out.extend_from_slice(&self.earliest_presentation_time.to_be_bytes());
            out.extend_from_slice(&self.first_offset.to_be_bytes());
        }

        out.extend_from_slice(&[0u8; 2]);
        out.extend_from_slice(&(self.references.len() as u16).to_be_bytes());

        for r in &self.references {
            let mut word = r.referenced_size & 0x7fff_ffff;
            if r.reference_type {
                word |= 0x8000_0000;
            }
            let mut sap = r.sap_delta_time & 0x0fff_ffff;
            sap |= u32::from(r.sap_type & 0x7) << 28;
            if r.starts_with_sap {
                sap |= 0x8000_0000;
            }

            out.extend_from_slice(&word.to_be_bytes());
            out.extend_from_slice(&r.subsegment_duration.to_be_bytes());
            out.extend_from_slice(&sap.to_be_bytes());
        }
    }
}

/// `meta`: a full box that then behaves as a container.
#[derive(Debug, Clone)]
pub struct MetaBox {
    pub children: Vec<Mp4Box>,
}

impl MetaBox {
    /// Builds the `udta`-style metadata container: `meta(hdlr=mdir, ilst)`.
    pub fn item_list(entries: Vec<IlstItem>) -> Self {
        MetaBox {
            children: vec![
                Mp4Box::Hdlr(HdlrBox::new(b"mdir")),
                Mp4Box::Ilst(IlstBox { items: entries }),
            ],
        }
    }

    fn decode(body: &Bytes) -> Result<Self, Mp4Error> {
        let (_, _, _) = full_box(body)?;
        let children = decode_children(&body.slice(4..))?;

        Ok(MetaBox { children })
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        put_full_box(out, 0, 0);
        for child in &self.children {
            child.encode_into(out);
        }
    }
}

/// One `ilst` entry: an item box wrapping a UTF-8 `data` box.
#[derive(Debug, Clone)]
pub struct IlstItem {
    pub key: FourCC,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct IlstBox {
    pub items: Vec<IlstItem>,
}

impl IlstBox {
    fn encode_body(&self, out: &mut Vec<u8>) {
        for item in &self.items {
            let outer = begin_box(out, item.key);
            let inner = begin_box(out, FourCC::new(b"data"));
            // data type 1 (UTF-8), default locale.
            out.extend_from_slice(&1u32.to_be_bytes());
            out.extend_from_slice(&0u32.to_be_bytes());
            out.extend_from_slice(&item.value);
            end_box(out, inner);
            end_box(out, outer);
        }
    }
}

/// Cursor over a box body.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Mp4Error> {
        if self.pos + n > self.data.len() {
            return Err(Mp4Error::parse("box body truncated"));
        }

        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn skip(&mut self, n: usize) -> Result<(), Mp4Error> {
        self.take(n).map(|_| ())
    }

    fn u16(&mut self) -> Result<u16, Mp4Error> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    fn u32(&mut self) -> Result<u32, Mp4Error> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    fn u64(&mut self) -> Result<u64, Mp4Error> {
        Ok(BigEndian::read_u64(self.take(8)?))
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], Mp4Error> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos..];
        self.pos = self.data.len();
        slice
    }
}
