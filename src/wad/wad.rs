//! Doom-format WAD archive access.
//!
//! The node builder reads an IWAD or PWAD, decodes one map at a time,
//! and writes its output into a separate wrapper WAD.  Input archives
//! are held fully in memory with every directory entry decoded and
//! bounds-checked up front, so lump access later on cannot fail.

use std::io::{self, Write};
use std::ops::Range;
use std::path::Path;

use byteorder::{LittleEndian as LE, WriteBytesExt};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::wad::level::MapFormat;

/// magic + lump count + directory offset
const HEADER_SIZE: usize = 12;

/// offset + size + 8-byte name
const DIR_ENTRY_SIZE: usize = 16;

/// Which flavour of archive the header announced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WadKind {
    /// Base game data.
    Iwad,
    /// Patch/addon data, the usual input for a node builder.
    Pwad,
}

/// One directory entry: its name decoded from the NUL-padded 8-byte
/// field, and the byte span of its data within the file.
#[derive(Clone, Debug)]
struct Lump {
    name: String,
    span: Range<usize>,
}

/// A whole WAD archive resident in memory.
#[derive(Debug)]
pub struct Wad {
    pub kind: WadKind,
    directory: Vec<Lump>,
    data: Vec<u8>,
}

/// Structural problems found while opening an archive.
#[derive(Error, Debug)]
pub enum WadError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("file too small to be a WAD ({0} bytes)")]
    TooSmall(usize),

    #[error("unrecognised WAD magic {0:?}")]
    UnknownMagic([u8; 4]),

    #[error("directory of {entries} entries at offset {offset} does not fit in {file_size} bytes")]
    TruncatedDirectory {
        entries: usize,
        offset: usize,
        file_size: usize,
    },

    #[error("lump {name} ends at {end}, past the end of the file ({file_size} bytes)")]
    LumpOutOfBounds {
        name: String,
        end: usize,
        file_size: usize,
    },
}

/// Decode an 8-byte lump name: stop at the first NUL, replace anything
/// non-ASCII.
fn decode_name(raw: &[u8]) -> String {
    raw.iter()
        .take_while(|&&b| b != 0)
        .map(|&b| if b.is_ascii() { b as char } else { '?' })
        .collect()
}

impl Wad {
    /// Read an archive from disk.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, WadError> {
        Self::from_bytes(std::fs::read(path)?)
    }

    /// Parse an archive already resident in memory.
    ///
    /// The 12-byte header gives the lump count and the position of the
    /// directory; each 16-byte directory entry is decoded and its data
    /// span checked against the file in the same pass.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, WadError> {
        if data.len() < HEADER_SIZE {
            return Err(WadError::TooSmall(data.len()));
        }

        let kind = match &data[0..4] {
            b"IWAD" => WadKind::Iwad,
            b"PWAD" => WadKind::Pwad,
            m => return Err(WadError::UnknownMagic([m[0], m[1], m[2], m[3]])),
        };

        let entries = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
        let offset = u32::from_le_bytes(data[8..12].try_into().unwrap()) as usize;

        let table = data
            .get(offset..)
            .and_then(|tail| tail.get(..entries * DIR_ENTRY_SIZE))
            .ok_or(WadError::TruncatedDirectory {
                entries,
                offset,
                file_size: data.len(),
            })?;

        let mut directory = Vec::with_capacity(entries);

        for entry in table.chunks_exact(DIR_ENTRY_SIZE) {
            let start = u32::from_le_bytes(entry[0..4].try_into().unwrap()) as usize;
            let size = u32::from_le_bytes(entry[4..8].try_into().unwrap()) as usize;
            let name = decode_name(&entry[8..16]);

            let span = start..start + size;
            if span.end > data.len() {
                return Err(WadError::LumpOutOfBounds {
                    name,
                    end: span.end,
                    file_size: data.len(),
                });
            }

            directory.push(Lump { name, span });
        }

        Ok(Self {
            kind,
            directory,
            data,
        })
    }

    // ---------------------------------------------------------------------
    // Lump access
    // ---------------------------------------------------------------------

    pub fn lump_count(&self) -> usize {
        self.directory.len()
    }

    /// Name of lump `idx`.
    pub fn lump_name(&self, idx: usize) -> &str {
        &self.directory[idx].name
    }

    /// Raw bytes of lump `idx`, borrowed from the archive buffer.
    pub fn lump_bytes(&self, idx: usize) -> &[u8] {
        &self.data[self.directory[idx].span.clone()]
    }

    /// Locate a lump by name.  Later lumps shadow earlier ones, the way
    /// engines resolve names when patch wads are stacked.
    pub fn find_lump(&self, name: &str) -> Option<usize> {
        self.directory.iter().rposition(|l| l.name == name)
    }

    // ---------------------------------------------------------------------
    // Level discovery
    // ---------------------------------------------------------------------

    /// Return directory indices of every map marker.
    ///
    /// A marker is recognised by the lumps that follow it: either a
    /// `TEXTMAP` lump (UDMF), or the four ordinary map lumps in any
    /// order.  The test is deliberately lax since wads exist with a
    /// non-standard lump ordering; a classic `ExMy`/`MAPxx` name followed
    /// by at least one map lump also counts.
    pub fn level_indices(&self) -> Vec<usize> {
        let mut markers = Vec::new();

        let mut k = 0;
        while k + 1 < self.directory.len() {
            if self.lump_name(k + 1) == "TEXTMAP" {
                markers.push(k);
                // skip the map body so its lumps are not re-detected
                k = self.level_last_lump(k) + 1;
                continue;
            }

            let mut part_mask = 0u32;
            let mut part_count = 0;

            for i in 1..=4 {
                if k + i >= self.directory.len() {
                    break;
                }

                let part = match self.lump_name(k + i) {
                    "THINGS" => 1,
                    "LINEDEFS" => 2,
                    "SIDEDEFS" => 3,
                    "VERTEXES" => 4,
                    "SECTORS" => 5,
                    _ => break,
                };

                // do not allow duplicates
                if part_mask & (1 << part) != 0 {
                    break;
                }

                part_mask |= 1 << part;
                part_count += 1;
            }

            if part_count == 4 || (part_count >= 1 && is_classic_map_name(self.lump_name(k))) {
                markers.push(k);
                k = self.level_last_lump(k) + 1;
            } else {
                k += 1;
            }
        }

        markers
    }

    /// Map format of the level at `marker`.
    pub fn level_format(&self, marker: usize) -> MapFormat {
        if marker + 1 < self.directory.len() && self.lump_name(marker + 1) == "TEXTMAP" {
            MapFormat::Udmf
        } else {
            MapFormat::Doom
        }
    }

    /// Name of the level marker lump.
    pub fn level_name(&self, marker: usize) -> &str {
        self.lump_name(marker)
    }

    /// Directory index of the last lump belonging to the level.
    fn level_last_lump(&self, marker: usize) -> usize {
        // a map never carries more lumps than this
        const MAX_LEVEL_LUMPS: usize = 21;

        let mut count = 1;

        if self.level_format(marker) == MapFormat::Udmf {
            while count < MAX_LEVEL_LUMPS && marker + count < self.directory.len() {
                let name = self.lump_name(marker + count);
                count += 1;
                if name == "ENDMAP" {
                    break;
                }
            }
        } else {
            while count < MAX_LEVEL_LUMPS
                && marker + count < self.directory.len()
                && is_level_lump(self.lump_name(marker + count))
            {
                count += 1;
            }
        }

        marker + count - 1
    }

    /// Find a lump by name within the level starting at `marker`.
    pub fn level_lookup(&self, marker: usize, name: &str) -> Option<usize> {
        let finish = self.level_last_lump(marker);

        (marker + 1..=finish).find(|&k| self.lump_name(k) == name)
    }
}

fn is_classic_map_name(name: &str) -> bool {
    static RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(E[0-9]M[0-9]|MAP[0-9][0-9])$").unwrap());
    RE.is_match(name)
}

fn is_level_lump(name: &str) -> bool {
    matches!(
        name,
        "THINGS"
            | "LINEDEFS"
            | "SIDEDEFS"
            | "VERTEXES"
            | "SECTORS"
            | "SEGS"
            | "SSECTORS"
            | "NODES"
            | "REJECT"
            | "BLOCKMAP"
            | "BEHAVIOR"
            | "SCRIPTS"
    ) || name.starts_with("GL_")
}

/*=======================================================================*/
/*                          XWA output writer                            */
/*=======================================================================*/

/// Accumulates node lumps and writes them as a `PWAD`-style wrapper:
/// an `XG_START` marker, one lump per level (named after the level
/// marker), then `XG_END`.
#[derive(Debug, Default)]
pub struct XwaWriter {
    lumps: Vec<([u8; 8], Vec<u8>)>,
}

fn pack_lump_name(name: &str) -> [u8; 8] {
    let mut packed = [0u8; 8];
    for (slot, byte) in packed.iter_mut().zip(name.bytes()) {
        *slot = byte.to_ascii_uppercase();
    }
    packed
}

impl XwaWriter {
    pub fn new() -> Self {
        let mut writer = Self::default();
        writer.add_lump("XG_START", Vec::new());
        writer
    }

    /// Queue the node lump for one level.  Names longer than eight
    /// characters are truncated, as in any WAD directory.
    pub fn add_lump(&mut self, name: &str, data: Vec<u8>) {
        self.lumps.push((pack_lump_name(name), data));
    }

    /// Serialize header, lump data and directory into one buffer.
    pub fn finish(mut self) -> Vec<u8> {
        self.add_lump("XG_END", Vec::new());

        let data_size: usize = self.lumps.iter().map(|(_, d)| d.len()).sum();

        let mut out = Vec::new();
        // writes into a Vec cannot fail
        out.write_all(b"PWAD").unwrap();
        out.write_u32::<LE>(self.lumps.len() as u32).unwrap();
        out.write_u32::<LE>((HEADER_SIZE + data_size) as u32).unwrap();

        for (_, data) in &self.lumps {
            out.write_all(data).unwrap();
        }

        let mut offset = HEADER_SIZE as u32;
        for (name, data) in &self.lumps {
            out.write_u32::<LE>(offset).unwrap();
            out.write_u32::<LE>(data.len() as u32).unwrap();
            out.write_all(name).unwrap();
            offset += data.len() as u32;
        }

        out
    }

    /// Write the finished file to disk.
    pub fn write_to<P: AsRef<Path>>(self, path: P) -> io::Result<()> {
        std::fs::write(path, self.finish())
    }
}

// ==========================================================================
// Unit tests
// ==========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Hand-craft a WAD with the given (name, data) lumps.
    fn make_wad(lumps: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"PWAD");
        out.extend(&(lumps.len() as u32).to_le_bytes());

        let data_size: usize = lumps.iter().map(|(_, d)| d.len()).sum();
        out.extend(&((HEADER_SIZE + data_size) as u32).to_le_bytes());

        for (_, data) in lumps {
            out.extend_from_slice(data);
        }

        let mut offset = HEADER_SIZE as u32;
        for (name, data) in lumps {
            out.extend(&offset.to_le_bytes());
            out.extend(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(&pack_lump_name(name));
            offset += data.len() as u32;
        }
        out
    }

    fn load(bytes: &[u8]) -> Wad {
        Wad::from_bytes(bytes.to_vec()).expect("parse wad")
    }

    fn names(wad: &Wad) -> Vec<&str> {
        (0..wad.lump_count()).map(|i| wad.lump_name(i)).collect()
    }

    #[test]
    fn opens_from_disk() {
        let tmp = tempfile::NamedTempFile::new().expect("tempfile");
        std::fs::write(tmp.path(), make_wad(&[("HELLO", b"abc")])).unwrap();

        let wad = Wad::from_file(tmp.path()).expect("open");
        assert_eq!(wad.kind, WadKind::Pwad);
        assert_eq!(names(&wad), vec!["HELLO"]);
        assert_eq!(wad.lump_bytes(0), b"abc");
    }

    #[test]
    fn rejects_short_file() {
        let err = Wad::from_bytes(b"PWAD\0\0\0".to_vec()).unwrap_err();
        assert!(matches!(err, WadError::TooSmall(7)));
    }

    #[test]
    fn rejects_unknown_magic() {
        let err = Wad::from_bytes(b"NOTAWAD_____".to_vec()).unwrap_err();
        assert!(matches!(err, WadError::UnknownMagic(m) if &m == b"NOTA"));
    }

    #[test]
    fn rejects_directory_past_eof() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"PWAD");
        bytes.extend(&1u32.to_le_bytes());
        bytes.extend(&1000u32.to_le_bytes()); // directory way past EOF

        let err = Wad::from_bytes(bytes).unwrap_err();
        assert!(matches!(err, WadError::TruncatedDirectory { offset: 1000, .. }));
    }

    #[test]
    fn rejects_lump_spilling_past_eof() {
        // one directory entry whose data span points beyond the file
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"PWAD");
        bytes.extend(&1u32.to_le_bytes());
        bytes.extend(&(HEADER_SIZE as u32).to_le_bytes()); // directory right after header

        bytes.extend(&500u32.to_le_bytes()); // lump offset past EOF
        bytes.extend(&4u32.to_le_bytes()); // lump size
        bytes.extend_from_slice(&pack_lump_name("BAD"));

        let err = Wad::from_bytes(bytes).unwrap_err();
        assert!(matches!(err, WadError::LumpOutOfBounds { end: 504, .. }));
    }

    #[test]
    fn later_lumps_shadow_earlier_ones() {
        let wad = load(&make_wad(&[("DUP", b"old"), ("DUP", b"new")]));
        let idx = wad.find_lump("DUP").unwrap();
        assert_eq!(wad.lump_bytes(idx), b"new");
    }

    #[test]
    fn finds_binary_map_markers() {
        let wad = load(&make_wad(&[
            ("MAP01", b""),
            ("THINGS", b"x"),
            ("LINEDEFS", b"x"),
            ("SIDEDEFS", b"x"),
            ("VERTEXES", b"x"),
            ("SECTORS", b"x"),
            ("DECOY", b"x"),
        ]));

        assert_eq!(wad.level_indices(), vec![0]);
        assert_eq!(wad.level_format(0), MapFormat::Doom);
        assert_eq!(wad.level_name(0), "MAP01");
    }

    #[test]
    fn finds_udmf_map_markers() {
        let wad = load(&make_wad(&[
            ("E1M1", b""),
            ("TEXTMAP", b"namespace=\"doom\";"),
            ("ENDMAP", b""),
        ]));

        assert_eq!(wad.level_indices(), vec![0]);
        assert_eq!(wad.level_format(0), MapFormat::Udmf);
    }

    #[test]
    fn classic_name_with_partial_lumps_is_accepted() {
        let wad = load(&make_wad(&[
            ("E2M4", b""),
            ("VERTEXES", b"x"),
            ("ODDBALL", b"x"),
        ]));
        assert_eq!(wad.level_indices(), vec![0]);
    }

    #[test]
    fn level_lookup_stays_within_the_map_span() {
        let wad = load(&make_wad(&[
            ("MAP01", b""),
            ("THINGS", b"a"),
            ("LINEDEFS", b"b"),
            ("SIDEDEFS", b"c"),
            ("VERTEXES", b"d"),
            ("SECTORS", b"e"),
            ("MAP02", b""),
            ("THINGS", b"f"),
            ("LINEDEFS", b"g"),
            ("SIDEDEFS", b"h"),
            ("VERTEXES", b"i"),
            ("SECTORS", b"j"),
        ]));

        assert_eq!(wad.level_indices(), vec![0, 6]);

        let things = wad.level_lookup(0, "THINGS").unwrap();
        assert_eq!(wad.lump_bytes(things), b"a");

        let things2 = wad.level_lookup(6, "THINGS").unwrap();
        assert_eq!(wad.lump_bytes(things2), b"f");

        assert_eq!(wad.level_lookup(0, "TEXTMAP"), None);
    }

    #[test]
    fn xwa_output_round_trips_through_the_reader() {
        let mut xwa = XwaWriter::new();
        xwa.add_lump("MAP01", vec![1, 2, 3, 4]);
        xwa.add_lump("MAP02", Vec::new());

        let wad = load(&xwa.finish());

        assert_eq!(names(&wad), vec!["XG_START", "MAP01", "MAP02", "XG_END"]);

        let map01 = wad.find_lump("MAP01").unwrap();
        assert_eq!(wad.lump_bytes(map01), &[1, 2, 3, 4]);
    }

    #[test]
    fn lump_names_pack_to_eight_bytes() {
        assert_eq!(&pack_lump_name("map01"), b"MAP01\0\0\0");
        assert_eq!(&pack_lump_name("VERYLONGNAME"), b"VERYLONG");
    }
}
