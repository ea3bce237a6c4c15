// crates/ar-format/src/lib.rs
//! Reader and serializer for the Unix `ar` container used by static libraries.
//!
//! Both BSD (`#1/<N>`) and GNU (`//` string table) long names are resolved on
//! read. Symbol-table and string-table members are consumed but never yielded.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use thiserror::Error;

// ==================== Errors ====================
#[derive(Error, Debug)]
pub enum ArError {
    #[error("not an ar archive: expected magic {expected:?}, found {found:?}")]
    InvalidMagic { expected: [u8; 8], found: Vec<u8> },
    #[error("parse error at offset {offset:#x}: {message}")]
    Parse { offset: u64, message: String },
    #[error("member {name:?} is too large for an ar header: {size} bytes")]
    MemberTooLarge { name: String, size: u64 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ArError>;

// ==================== Constants ====================
pub const AR_MAGIC: [u8; 8] = *b"!<arch>\n";
pub const HEADER_SIZE: usize = 60;
pub const HEADER_TERMINATOR: [u8; 2] = *b"`\n";
pub const BSD_LONG_NAME_PREFIX: &[u8] = b"#1/";
pub const SYMDEF_PREFIX: &str = "__.SYMDEF";
pub const GNU_SYMTAB: &str = "/";
pub const GNU_SYMTAB_64: &str = "/SYM64/";
pub const GNU_STRTAB: &str = "//";

const NAME_FIELD: std::ops::Range<usize> = 0..16;
const SIZE_FIELD: std::ops::Range<usize> = 48..58;
const TERMINATOR_FIELD: std::ops::Range<usize> = 58..60;
const MAX_SIZE_FIELD: u64 = 9_999_999_999;

// ==================== Header ====================
/// The parts of a 60-byte member header this crate cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArHeader {
    pub name: [u8; 16],
    pub size: u64,
}

impl ArHeader {
    /// Decodes a raw header found at `offset` in the archive.
    pub fn parse(raw: &[u8; HEADER_SIZE], offset: u64) -> Result<Self> {
        let mut name = [0u8; 16];
        name.copy_from_slice(&raw[NAME_FIELD]);

        let size = parse_decimal(trim_ascii(&raw[SIZE_FIELD]), offset, "member size")?;

        if raw[TERMINATOR_FIELD] != HEADER_TERMINATOR {
            log::warn!(
                "unexpected header terminator {:02x?} at offset {:#x}",
                &raw[TERMINATOR_FIELD],
                offset
            );
        }

        Ok(Self { name, size })
    }

    /// Name field with surrounding ASCII whitespace removed.
    pub fn name_field(&self) -> &[u8] {
        trim_ascii(&self.name)
    }

    fn write(out: &mut Vec<u8>, name_field: &[u8], size: u64) {
        let start = out.len();
        out.extend_from_slice(name_field);
        out.resize(start + 16, b' ');
        push_field(out, "0", 12); // mtime
        push_field(out, "0", 6); // uid
        push_field(out, "0", 6); // gid
        push_field(out, "644", 8); // mode
        push_field(out, &size.to_string(), 10);
        out.extend_from_slice(&HEADER_TERMINATOR);
    }
}

fn push_field(out: &mut Vec<u8>, value: &str, width: usize) {
    let start = out.len();
    out.extend_from_slice(value.as_bytes());
    out.resize(start + width, b' ');
}

// ==================== Members ====================
/// One resolved archive member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveMember {
    /// Position among yielded members, starting at 0.
    pub index: usize,
    pub name: String,
    pub data: Vec<u8>,
}

/// Returns true for members that carry archive bookkeeping instead of objects.
pub fn is_special_name(name: &str) -> bool {
    name.is_empty()
        || name.starts_with(SYMDEF_PREFIX)
        || name == GNU_SYMTAB
        || name == GNU_STRTAB
        || name == GNU_SYMTAB_64.trim_end_matches('/')
}

// ==================== Reader ====================
/// Streams members out of an archive in file order.
///
/// The iterator is fused: after the end of the archive or the first error it
/// only returns `None`.
pub struct ArchiveReader<R> {
    inner: R,
    pos: u64,
    next_index: usize,
    long_names: Option<Vec<u8>>,
    done: bool,
}

impl<R: Read> ArchiveReader<R> {
    /// Checks the magic and positions the reader on the first header.
    pub fn new(mut inner: R) -> Result<Self> {
        let mut magic = [0u8; 8];
        let got = read_full(&mut inner, &mut magic)?;
        if got < magic.len() || magic != AR_MAGIC {
            return Err(ArError::InvalidMagic {
                expected: AR_MAGIC,
                found: magic[..got].to_vec(),
            });
        }

        Ok(Self {
            inner,
            pos: AR_MAGIC.len() as u64,
            next_index: 0,
            long_names: None,
            done: false,
        })
    }

    fn next_member(&mut self) -> Result<Option<ArchiveMember>> {
        loop {
            if self.pos % 2 == 1 {
                let mut pad = [0u8; 1];
                if read_full(&mut self.inner, &mut pad)? == 0 {
                    return Ok(None);
                }
                self.pos += 1;
            }

            let offset = self.pos;
            let mut raw = [0u8; HEADER_SIZE];
            let got = read_full(&mut self.inner, &mut raw)?;
            if got < HEADER_SIZE {
                if got > 0 {
                    log::debug!("ignoring {} trailing bytes at offset {:#x}", got, offset);
                }
                return Ok(None);
            }
            self.pos += HEADER_SIZE as u64;

            let header = ArHeader::parse(&raw, offset)?;
            let mut data = Vec::new();
            (&mut self.inner).take(header.size).read_to_end(&mut data)?;
            if (data.len() as u64) < header.size {
                return Err(ArError::Parse {
                    offset,
                    message: format!(
                        "truncated member payload: expected {} bytes, found {}",
                        header.size,
                        data.len()
                    ),
                });
            }
            self.pos += header.size;

            if let Some((name, data)) = self.resolve(&header, data, offset)? {
                if is_special_name(&name) {
                    log::debug!("skipping special member {:?} at offset {:#x}", name, offset);
                    continue;
                }
                let index = self.next_index;
                self.next_index += 1;
                log::debug!("member [{}] {} ({} bytes) at offset {:#x}", index, name, data.len(), offset);
                return Ok(Some(ArchiveMember { index, name, data }));
            }
        }
    }

    /// Works out the member name; `None` means the record was bookkeeping
    /// that has been absorbed into the reader state.
    fn resolve(
        &mut self,
        header: &ArHeader,
        mut data: Vec<u8>,
        offset: u64,
    ) -> Result<Option<(String, Vec<u8>)>> {
        let field = header.name_field();

        if let Some(len) = field.strip_prefix(BSD_LONG_NAME_PREFIX) {
            let len = parse_decimal(len, offset, "extended name length")? as usize;
            if len > data.len() {
                return Err(ArError::Parse {
                    offset,
                    message: format!(
                        "extended name length {} exceeds member size {}",
                        len,
                        data.len()
                    ),
                });
            }
            let content = data.split_off(len);
            let name = decode_name(trim_trailing_nul(&data));
            return Ok(Some((name, content)));
        }

        if field == GNU_STRTAB.as_bytes() {
            self.long_names = Some(data);
            return Ok(None);
        }

        if let Some(name_offset) = gnu_long_name_offset(field) {
            let name = self.lookup_long_name(name_offset, offset)?;
            return Ok(Some((name, data)));
        }

        let mut end = field.len();
        while end > 0 && field[end - 1] == b'/' {
            end -= 1;
        }
        Ok(Some((decode_name(&field[..end]), data)))
    }

    fn lookup_long_name(&self, name_offset: usize, offset: u64) -> Result<String> {
        let table = self.long_names.as_deref().ok_or_else(|| ArError::Parse {
            offset,
            message: "long name reference without a `//` string table".to_string(),
        })?;
        if name_offset >= table.len() {
            return Err(ArError::Parse {
                offset,
                message: format!(
                    "long name offset {} outside string table of {} bytes",
                    name_offset,
                    table.len()
                ),
            });
        }
        let rest = &table[name_offset..];
        let end = rest.iter().position(|&b| b == b'\n').unwrap_or(rest.len());
        let mut name = &rest[..end];
        if let Some(stripped) = name.strip_suffix(b"/") {
            name = stripped;
        }
        Ok(decode_name(name))
    }
}

impl<R: Read> Iterator for ArchiveReader<R> {
    type Item = Result<ArchiveMember>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_member() {
            Ok(Some(member)) => Some(Ok(member)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Reads every member of the archive at `path`.
pub fn read_archive(path: impl AsRef<Path>) -> Result<Vec<ArchiveMember>> {
    let file = File::open(path.as_ref())?;
    ArchiveReader::new(BufReader::new(file))?.collect()
}

/// Reads every member of an in-memory archive.
pub fn parse_archive(bytes: &[u8]) -> Result<Vec<ArchiveMember>> {
    ArchiveReader::new(bytes)?.collect()
}

// ==================== Builder ====================
/// Serializes members into an archive without a symbol table.
#[derive(Debug, Default)]
pub struct ArchiveBuilder {
    entries: Vec<(String, Vec<u8>)>,
    extended_names: bool,
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes every name in `#1/<N>` form, even short ones.
    pub fn extended_names(mut self, enabled: bool) -> Self {
        self.extended_names = enabled;
        self
    }

    pub fn add_member(&mut self, name: &str, bytes: &[u8]) -> &mut Self {
        self.entries.push((name.to_string(), bytes.to_vec()));
        self
    }

    pub fn build(&self) -> Result<Vec<u8>> {
        let mut out = AR_MAGIC.to_vec();
        for (name, bytes) in &self.entries {
            if self.extended_names || !fits_name_field(name) {
                let mut padded = name.as_bytes().to_vec();
                let width = (padded.len() + 7) / 8 * 8;
                padded.resize(width, 0);
                let size = check_size(name, (padded.len() + bytes.len()) as u64)?;
                let field = format!("#1/{}", padded.len());
                ArHeader::write(&mut out, field.as_bytes(), size);
                out.extend_from_slice(&padded);
            } else {
                let size = check_size(name, bytes.len() as u64)?;
                ArHeader::write(&mut out, name.as_bytes(), size);
            }
            out.extend_from_slice(bytes);
            if out.len() % 2 == 1 {
                out.push(b'\n');
            }
        }
        Ok(out)
    }
}

fn fits_name_field(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 16
        && !name.bytes().any(|b| b.is_ascii_whitespace())
        && !name.starts_with('/')
        && !name.ends_with('/')
        && !name.as_bytes().starts_with(BSD_LONG_NAME_PREFIX)
}

fn check_size(name: &str, size: u64) -> Result<u64> {
    if size > MAX_SIZE_FIELD {
        return Err(ArError::MemberTooLarge { name: name.to_string(), size });
    }
    Ok(size)
}

// ==================== Helpers ====================
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &bytes[start..end]
}

fn trim_trailing_nul(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    &bytes[..end]
}

fn decode_name(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn parse_decimal(text: &[u8], offset: u64, what: &str) -> Result<u64> {
    std::str::from_utf8(text)
        .ok()
        .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ArError::Parse {
            offset,
            message: format!("invalid {}: {:?}", what, String::from_utf8_lossy(text)),
        })
}

fn gnu_long_name_offset(field: &[u8]) -> Option<usize> {
    let digits = field.strip_prefix(b"/")?;
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(name: &str, size: usize) -> Vec<u8> {
        let mut out = Vec::new();
        ArHeader::write(&mut out, name.as_bytes(), size as u64);
        out
    }

    fn push_member(bytes: &mut Vec<u8>, name: &str, payload: &[u8]) {
        bytes.extend(header(name, payload.len()));
        bytes.extend_from_slice(payload);
        if bytes.len() % 2 == 1 {
            bytes.push(b'\n');
        }
    }

    fn names(members: &[ArchiveMember]) -> Vec<&str> {
        members.iter().map(|m| m.name.as_str()).collect()
    }

    #[test]
    fn reads_short_names_in_order() {
        let mut b = ArchiveBuilder::new();
        b.add_member("a.o", b"AAAA").add_member("ggml.c.o", b"GG").add_member("b.o", b"B");
        let bytes = b.build().expect("build");

        let members = parse_archive(&bytes).expect("parse");
        assert_eq!(names(&members), ["a.o", "ggml.c.o", "b.o"]);
        assert_eq!(members[0].data, b"AAAA");
        assert_eq!(members[2].data, b"B");
        assert_eq!(members.iter().map(|m| m.index).collect::<Vec<_>>(), [0, 1, 2]);
    }

    #[test]
    fn odd_payloads_are_padded_and_skipped() {
        let mut b = ArchiveBuilder::new();
        b.add_member("odd.o", b"123").add_member("next.o", b"xy");
        let bytes = b.build().expect("build");

        // magic + header + 3 payload bytes + 1 pad
        assert_eq!(bytes[8 + HEADER_SIZE + 3], b'\n');
        let members = parse_archive(&bytes).expect("parse");
        assert_eq!(members[0].data, b"123");
        assert_eq!(members[1].name, "next.o");
        assert_eq!(members[1].data, b"xy");
    }

    #[test]
    fn bsd_extended_name_matches_short_form() {
        let mut short = ArchiveBuilder::new();
        short.add_member("ggml-alloc.c.o", b"payload");
        let mut long = ArchiveBuilder::new().extended_names(true);
        long.add_member("ggml-alloc.c.o", b"payload");

        let short = parse_archive(&short.build().unwrap()).unwrap();
        let long_bytes = long.build().unwrap();
        assert_eq!(&long_bytes[8..11], b"#1/");
        let long = parse_archive(&long_bytes).unwrap();

        assert_eq!(short, long);
        assert_eq!(long[0].data, b"payload");
    }

    #[test]
    fn long_names_switch_to_extended_form() {
        let name = "a-rather-long-object-name.c.o";
        let mut b = ArchiveBuilder::new();
        b.add_member(name, b"x");
        let bytes = b.build().unwrap();
        assert_eq!(&bytes[8..12], b"#1/3");
        assert_eq!(parse_archive(&bytes).unwrap()[0].name, name);
    }

    #[test]
    fn symbol_tables_are_not_yielded() {
        let mut b = ArchiveBuilder::new();
        b.add_member("__.SYMDEF SORTED", b"\0\0\0\0").add_member("a.o", b"A");
        let mut bytes = b.build().unwrap();
        // GNU symbol table appended by hand
        push_member(&mut bytes, "/", b"\0\0\0\0");
        push_member(&mut bytes, "/SYM64/", b"\0\0");

        let members = parse_archive(&bytes).unwrap();
        assert_eq!(names(&members), ["a.o"]);
        assert_eq!(members[0].index, 0);
    }

    #[test]
    fn gnu_long_names_resolve_through_string_table() {
        let table = b"a-rather-long-object-name.o/\nanother-long-object-name.o/\n";
        let mut bytes = AR_MAGIC.to_vec();
        push_member(&mut bytes, "/", b"\0\0\0\0");
        push_member(&mut bytes, "//", table);
        push_member(&mut bytes, "/29", b"L2");
        push_member(&mut bytes, "short.o/", b"S1x");
        push_member(&mut bytes, "/0", b"L1");

        let members = parse_archive(&bytes).unwrap();
        assert_eq!(
            names(&members),
            ["another-long-object-name.o", "short.o", "a-rather-long-object-name.o"]
        );
        assert_eq!(members[1].data, b"S1x");
        assert_eq!(members[2].data, b"L1");
    }

    #[test]
    fn gnu_long_name_without_table_fails() {
        let mut bytes = AR_MAGIC.to_vec();
        bytes.extend(header("/0", 2));
        bytes.extend_from_slice(b"xx");
        assert!(matches!(parse_archive(&bytes), Err(ArError::Parse { offset: 8, .. })));
    }

    #[test]
    fn invalid_magic_is_rejected() {
        let err = parse_archive(b"!<arch>X rest").unwrap_err();
        match err {
            ArError::InvalidMagic { found, .. } => assert_eq!(found, b"!<arch>X"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(parse_archive(b"!<ar"), Err(ArError::InvalidMagic { .. })));
    }

    #[test]
    fn partial_trailing_header_ends_cleanly() {
        let mut b = ArchiveBuilder::new();
        b.add_member("a.o", b"AA");
        let mut bytes = b.build().unwrap();
        bytes.extend_from_slice(b"garbage shorter than a header");
        assert_eq!(names(&parse_archive(&bytes).unwrap()), ["a.o"]);
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let mut bytes = AR_MAGIC.to_vec();
        bytes.extend(header("a.o", 10));
        bytes.extend_from_slice(b"short");
        let err = parse_archive(&bytes).unwrap_err();
        assert!(err.to_string().contains("truncated member payload"), "{err}");
    }

    #[test]
    fn bad_size_field_names_the_offset() {
        let mut bytes = AR_MAGIC.to_vec();
        let mut h = header("a.o", 0);
        h[48..58].copy_from_slice(b"12x       ");
        bytes.extend(h);
        match parse_archive(&bytes) {
            Err(ArError::Parse { offset, message }) => {
                assert_eq!(offset, 8);
                assert!(message.contains("member size"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn extended_name_longer_than_payload_fails() {
        let mut bytes = AR_MAGIC.to_vec();
        bytes.extend(header("#1/20", 4));
        bytes.extend_from_slice(b"abcd");
        assert!(matches!(parse_archive(&bytes), Err(ArError::Parse { .. })));
    }

    #[test]
    fn undecodable_names_are_replaced() {
        let mut bytes = AR_MAGIC.to_vec();
        bytes.extend(header("#1/4", 6));
        bytes.extend_from_slice(&[b'x', 0xff, 0, 0, b'o', b'k']);
        let members = parse_archive(&bytes).unwrap();
        assert_eq!(members[0].name, "x\u{fffd}");
        assert_eq!(members[0].data, b"ok");
    }

    #[test]
    fn reader_is_fused_after_error() {
        let mut bytes = AR_MAGIC.to_vec();
        bytes.extend(header("a.o", 10));
        let mut reader = ArchiveReader::new(bytes.as_slice()).unwrap();
        assert!(matches!(reader.next(), Some(Err(_))));
        assert!(reader.next().is_none());
    }

    #[test]
    fn empty_archive_has_no_members() {
        let bytes = ArchiveBuilder::new().build().unwrap();
        assert_eq!(bytes, AR_MAGIC);
        assert!(parse_archive(&bytes).unwrap().is_empty());
    }
}
