//! XML document codec for the database tree.
//!
//! Element names are the wire contract: `KeePassFile > Meta` and
//! `Root > Group > Entry` with a trailing `DeletedObjects` list. Protected
//! values are XOR-encoded against a ChaCha20 keystream derived from the
//! header's protected-stream key and marked `Protected="True"`; the reader
//! consumes the keystream in document order, so write and read order must
//! match.
//!
//! The writer is a plain depth-first recursion that receives the tree and
//! its state as parameters — reentrant, no stream or UI context captured.
//!
//! A restricted plain variant (`write_entry_list`/`read_entry_list`, no
//! header, no encryption) serializes only an entry list for trusted
//! same-process transfers.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use chrono::{DateTime, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use sha2::{Digest, Sha512};
use std::borrow::Cow;
use std::io::Write;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::database::{Database, DeletedObject};
use crate::model::entry::{is_standard_key, AutoType, AutoTypeAssociation, Entry};
use crate::model::group::Group;
use crate::model::meta::{CustomIcon, MemoryProtection, Meta};
use crate::model::protected::{ProtectedBinary, ProtectedString};
use crate::model::times::Times;
use crate::status::{check_continue, StatusLogger};

const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Serialization switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct XmlOptions {
    /// Re-map unprotected text character-by-character into the legacy code
    /// page (anything outside Latin-1 becomes `?`) for localized-name
    /// compatibility with old consumers.
    pub legacy_charset: bool,
}

/// Keystream for in-document protected values. Both sides hash the 32-byte
/// protected-stream key with SHA-512 and split the digest into cipher key
/// and nonce.
pub struct ProtectedStream {
    cipher: ChaCha20,
}

impl ProtectedStream {
    pub fn new(stream_key: &[u8; 32]) -> Self {
        let hash = Sha512::digest(stream_key);
        let mut key = [0u8; 32];
        key.copy_from_slice(&hash[..32]);
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&hash[32..44]);
        Self {
            cipher: ChaCha20::new(&key.into(), &nonce.into()),
        }
    }

    fn apply(&mut self, data: &mut [u8]) {
        self.cipher.apply_keystream(data);
    }
}

fn xml_err<E: std::fmt::Display>(e: E) -> Error {
    Error::Xml(e.to_string())
}

// ── Writing ─────────────────────────────────────────────────────────────────

struct WriteCtx<'a> {
    stream: Option<ProtectedStream>,
    protection: MemoryProtection,
    opts: XmlOptions,
    logger: &'a dyn StatusLogger,
    total_entries: usize,
    processed: usize,
}

impl WriteCtx<'_> {
    fn tick(&mut self) -> Result<()> {
        self.processed += 1;
        let percent = (self.processed * 100 / self.total_entries.max(1)).min(100) as u32;
        check_continue(self.logger, percent)
    }
}

/// Serialize the whole tree. `stream_key` is `Some` for container writes and
/// `None` for the trusted plain variant.
pub fn write_document(
    db: &Database,
    stream_key: Option<&[u8; 32]>,
    opts: XmlOptions,
    logger: &dyn StatusLogger,
    out: &mut impl Write,
) -> Result<()> {
    let mut ctx = WriteCtx {
        stream: stream_key.map(ProtectedStream::new),
        protection: db.meta.memory_protection.clone(),
        opts,
        logger,
        total_entries: db.entry_count(),
        processed: 0,
    };
    let mut w = Writer::new(out);
    w.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))
        .map_err(xml_err)?;
    start(&mut w, "KeePassFile")?;
    write_meta(&mut w, &db.meta)?;
    start(&mut w, "Root")?;
    write_group(&mut w, &db.root, &mut ctx)?;
    write_deleted_objects(&mut w, &db.deleted_objects)?;
    end(&mut w, "Root")?;
    end(&mut w, "KeePassFile")?;
    Ok(())
}

/// Plain serialization of an entry list only — no header, no encryption, no
/// compression. For same-process transfers.
pub fn write_entry_list(entries: &[Entry], out: &mut impl Write) -> Result<()> {
    let mut ctx = WriteCtx {
        stream: None,
        protection: MemoryProtection::default(),
        opts: XmlOptions::default(),
        logger: &crate::status::NullStatusLogger,
        total_entries: entries.len(),
        processed: 0,
    };
    let mut w = Writer::new(out);
    w.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))
        .map_err(xml_err)?;
    start(&mut w, "EntryList")?;
    for entry in entries {
        write_entry(&mut w, entry, &mut ctx, true)?;
    }
    end(&mut w, "EntryList")?;
    Ok(())
}

fn start<W: Write>(w: &mut Writer<W>, name: &str) -> Result<()> {
    w.write_event(Event::Start(BytesStart::new(name)))
        .map_err(xml_err)
}

fn end<W: Write>(w: &mut Writer<W>, name: &str) -> Result<()> {
    w.write_event(Event::End(BytesEnd::new(name)))
        .map_err(xml_err)
}

fn text_el<W: Write>(w: &mut Writer<W>, name: &str, value: &str) -> Result<()> {
    start(w, name)?;
    w.write_event(Event::Text(BytesText::new(value)))
        .map_err(xml_err)?;
    end(w, name)
}

fn bool_el<W: Write>(w: &mut Writer<W>, name: &str, value: bool) -> Result<()> {
    text_el(w, name, if value { "True" } else { "False" })
}

fn time_el<W: Write>(w: &mut Writer<W>, name: &str, value: DateTime<Utc>) -> Result<()> {
    text_el(w, name, &value.format(TIME_FORMAT).to_string())
}

fn uuid_el<W: Write>(w: &mut Writer<W>, name: &str, value: Uuid) -> Result<()> {
    text_el(w, name, &BASE64.encode(value.as_bytes()))
}

fn opt_uuid_el<W: Write>(w: &mut Writer<W>, name: &str, value: Option<Uuid>) -> Result<()> {
    uuid_el(w, name, value.unwrap_or(Uuid::nil()))
}

fn legacy_remap(text: &str) -> Cow<'_, str> {
    if text.chars().all(|c| (c as u32) <= 0xFF) {
        Cow::Borrowed(text)
    } else {
        Cow::Owned(
            text.chars()
                .map(|c| if (c as u32) <= 0xFF { c } else { '?' })
                .collect(),
        )
    }
}

fn write_meta<W: Write>(w: &mut Writer<W>, meta: &Meta) -> Result<()> {
    start(w, "Meta")?;
    text_el(w, "Generator", &meta.generator)?;
    text_el(w, "DatabaseName", &meta.database_name)?;
    text_el(w, "DatabaseDescription", &meta.database_description)?;
    text_el(w, "DefaultUserName", &meta.default_user_name)?;
    text_el(
        w,
        "MaintenanceHistoryDays",
        &meta.maintenance_history_days.to_string(),
    )?;
    text_el(w, "HistoryMaxItems", &meta.history_max_items.to_string())?;

    start(w, "MemoryProtection")?;
    bool_el(w, "ProtectTitle", meta.memory_protection.protect_title)?;
    bool_el(w, "ProtectUserName", meta.memory_protection.protect_user_name)?;
    bool_el(w, "ProtectPassword", meta.memory_protection.protect_password)?;
    bool_el(w, "ProtectURL", meta.memory_protection.protect_url)?;
    bool_el(w, "ProtectNotes", meta.memory_protection.protect_notes)?;
    end(w, "MemoryProtection")?;

    if !meta.custom_icons.is_empty() {
        start(w, "CustomIcons")?;
        for icon in &meta.custom_icons {
            start(w, "Icon")?;
            uuid_el(w, "UUID", icon.uuid)?;
            text_el(w, "Data", &BASE64.encode(&icon.data))?;
            end(w, "Icon")?;
        }
        end(w, "CustomIcons")?;
    }

    bool_el(w, "RecycleBinEnabled", meta.recycle_bin_enabled)?;
    opt_uuid_el(w, "RecycleBinUUID", meta.recycle_bin_uuid)?;
    time_el(w, "RecycleBinChanged", meta.recycle_bin_changed)?;
    opt_uuid_el(w, "LastSelectedGroup", meta.last_selected_group)?;
    opt_uuid_el(w, "LastTopVisibleGroup", meta.last_top_visible_group)?;
    end(w, "Meta")
}

fn write_times<W: Write>(w: &mut Writer<W>, times: &Times) -> Result<()> {
    start(w, "Times")?;
    time_el(w, "CreationTime", times.creation)?;
    time_el(w, "LastModificationTime", times.last_modification)?;
    time_el(w, "LastAccessTime", times.last_access)?;
    time_el(w, "ExpiryTime", times.expiry)?;
    bool_el(w, "Expires", times.expires)?;
    text_el(w, "UsageCount", &times.usage_count.to_string())?;
    time_el(w, "LocationChanged", times.location_changed)?;
    end(w, "Times")
}

fn write_group<W: Write>(w: &mut Writer<W>, group: &Group, ctx: &mut WriteCtx) -> Result<()> {
    start(w, "Group")?;
    uuid_el(w, "UUID", group.uuid)?;
    text_el(w, "Name", &group.name)?;
    text_el(w, "Notes", &group.notes)?;
    text_el(w, "IconID", &group.icon_id.to_string())?;
    if let Some(icon) = group.custom_icon {
        uuid_el(w, "CustomIconUUID", icon)?;
    }
    write_times(w, &group.times)?;
    bool_el(w, "IsExpanded", group.is_expanded)?;
    if let Some(seq) = &group.default_auto_type_sequence {
        text_el(w, "DefaultAutoTypeSequence", seq)?;
    }
    opt_uuid_el(w, "LastTopVisibleEntry", group.last_top_visible_entry)?;

    // A group's entries come immediately after the group itself, then its
    // child groups, closed in matching order.
    for entry in &group.entries {
        write_entry(w, entry, ctx, true)?;
    }
    for child in &group.groups {
        write_group(w, child, ctx)?;
    }
    end(w, "Group")
}

fn write_entry<W: Write>(
    w: &mut Writer<W>,
    entry: &Entry,
    ctx: &mut WriteCtx,
    with_history: bool,
) -> Result<()> {
    start(w, "Entry")?;
    uuid_el(w, "UUID", entry.uuid)?;
    text_el(w, "IconID", &entry.icon_id.to_string())?;
    if let Some(icon) = entry.custom_icon {
        uuid_el(w, "CustomIconUUID", icon)?;
    }
    if let Some(color) = &entry.foreground_color {
        text_el(w, "ForegroundColor", color)?;
    }
    if let Some(color) = &entry.background_color {
        text_el(w, "BackgroundColor", color)?;
    }
    text_el(w, "OverrideURL", &entry.override_url)?;
    if !entry.tags.is_empty() {
        text_el(w, "Tags", &entry.tags.join(";"))?;
    }
    write_times(w, &entry.times)?;

    for (key, value) in entry.fields.iter() {
        write_string_field(w, key, value, ctx)?;
    }
    for (name, value) in &entry.binaries {
        write_binary_field(w, name, value, ctx)?;
    }
    write_auto_type(w, &entry.auto_type)?;

    // History for live entries only, and snapshots never nest further.
    if with_history && !entry.history.is_empty() {
        start(w, "History")?;
        for snapshot in &entry.history {
            write_entry(w, snapshot, ctx, false)?;
        }
        end(w, "History")?;
    }
    end(w, "Entry")?;

    if with_history {
        ctx.tick()?;
    }
    Ok(())
}

fn write_string_field<W: Write>(
    w: &mut Writer<W>,
    key: &str,
    value: &ProtectedString,
    ctx: &mut WriteCtx,
) -> Result<()> {
    let protect = if is_standard_key(key) {
        ctx.protection.protects(key)
    } else {
        value.is_protected()
    };

    start(w, "String")?;
    text_el(w, "Key", key)?;
    match (&mut ctx.stream, protect) {
        (Some(stream), true) => {
            let mut bytes = value.reveal().to_vec();
            stream.apply(&mut bytes);
            let mut el = BytesStart::new("Value");
            el.push_attribute(("Protected", "True"));
            w.write_event(Event::Start(el)).map_err(xml_err)?;
            w.write_event(Event::Text(BytesText::new(&BASE64.encode(&bytes))))
                .map_err(xml_err)?;
            end(w, "Value")?;
        }
        (None, true) => {
            // Plain variant: no keystream, flag carried as an attribute.
            let mut el = BytesStart::new("Value");
            el.push_attribute(("ProtectedInMemory", "True"));
            w.write_event(Event::Start(el)).map_err(xml_err)?;
            w.write_event(Event::Text(BytesText::new(&value.read())))
                .map_err(xml_err)?;
            end(w, "Value")?;
        }
        (_, false) => {
            let text = value.read();
            let text = if ctx.opts.legacy_charset {
                legacy_remap(&text)
            } else {
                Cow::Borrowed(text.as_str())
            };
            text_el(w, "Value", &text)?;
        }
    }
    end(w, "String")
}

fn write_binary_field<W: Write>(
    w: &mut Writer<W>,
    name: &str,
    value: &ProtectedBinary,
    ctx: &mut WriteCtx,
) -> Result<()> {
    start(w, "Binary")?;
    text_el(w, "Key", name)?;
    let mut bytes = value.reveal().to_vec();
    if value.is_protected() {
        let mut el = BytesStart::new("Value");
        if let Some(stream) = &mut ctx.stream {
            stream.apply(&mut bytes);
            el.push_attribute(("Protected", "True"));
        } else {
            el.push_attribute(("ProtectedInMemory", "True"));
        }
        w.write_event(Event::Start(el)).map_err(xml_err)?;
        w.write_event(Event::Text(BytesText::new(&BASE64.encode(&bytes))))
            .map_err(xml_err)?;
        end(w, "Value")?;
    } else {
        text_el(w, "Value", &BASE64.encode(&bytes))?;
    }
    end(w, "Binary")
}

fn write_auto_type<W: Write>(w: &mut Writer<W>, auto_type: &AutoType) -> Result<()> {
    start(w, "AutoType")?;
    bool_el(w, "Enabled", auto_type.enabled)?;
    text_el(
        w,
        "DataTransferObfuscation",
        &auto_type.obfuscation.to_string(),
    )?;
    if let Some(seq) = &auto_type.default_sequence {
        text_el(w, "DefaultSequence", seq)?;
    }
    for assoc in &auto_type.associations {
        start(w, "Association")?;
        text_el(w, "Window", &assoc.window)?;
        if let Some(seq) = &assoc.sequence {
            text_el(w, "KeystrokeSequence", seq)?;
        }
        end(w, "Association")?;
    }
    end(w, "AutoType")
}

fn write_deleted_objects<W: Write>(
    w: &mut Writer<W>,
    objects: &[DeletedObject],
) -> Result<()> {
    start(w, "DeletedObjects")?;
    for obj in objects {
        start(w, "DeletedObject")?;
        uuid_el(w, "UUID", obj.uuid)?;
        time_el(w, "DeletionTime", obj.deletion_time)?;
        end(w, "DeletedObject")?;
    }
    end(w, "DeletedObjects")
}

// ── Reading ─────────────────────────────────────────────────────────────────

struct ReadCtx<'a> {
    stream: Option<ProtectedStream>,
    logger: &'a dyn StatusLogger,
    total_entries: usize,
    processed: usize,
}

impl ReadCtx<'_> {
    fn tick(&mut self) -> Result<()> {
        self.processed += 1;
        let percent = (self.processed * 100 / self.total_entries.max(1)).min(100) as u32;
        check_continue(self.logger, percent)
    }
}

/// Parse a full document back into a tree, reversing the protected-value
/// encoding.
pub fn read_document(
    data: &[u8],
    stream_key: Option<&[u8; 32]>,
    logger: &dyn StatusLogger,
) -> Result<Database> {
    let text = std::str::from_utf8(data).map_err(|e| Error::Xml(format!("not UTF-8: {e}")))?;
    let mut ctx = ReadCtx {
        stream: stream_key.map(ProtectedStream::new),
        logger,
        total_entries: text.matches("<Entry>").count(),
        processed: 0,
    };
    let mut reader = Reader::from_reader(text.as_bytes());

    let mut db = Database::new("");
    let mut seen_root_file = false;
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => match e.name().as_ref() {
                b"KeePassFile" => seen_root_file = true,
                b"Meta" => db.meta = read_meta(&mut reader)?,
                b"Root" => read_root(&mut reader, &mut db, &mut ctx)?,
                other => {
                    let name = other.to_vec();
                    skip_element(&mut reader, &name)?;
                }
            },
            Event::Eof => break,
            _ => {}
        }
    }
    if !seen_root_file {
        return Err(Error::Xml("missing KeePassFile element".into()));
    }
    Ok(db)
}

/// Parse the plain entry-list variant.
pub fn read_entry_list(data: &[u8]) -> Result<Vec<Entry>> {
    let text = std::str::from_utf8(data).map_err(|e| Error::Xml(format!("not UTF-8: {e}")))?;
    let mut ctx = ReadCtx {
        stream: None,
        logger: &crate::status::NullStatusLogger,
        total_entries: text.matches("<Entry>").count(),
        processed: 0,
    };
    let mut reader = Reader::from_reader(text.as_bytes());
    let mut entries = Vec::new();
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => match e.name().as_ref() {
                b"EntryList" => {}
                b"Entry" => entries.push(read_entry(&mut reader, &mut ctx, true)?),
                other => {
                    let name = other.to_vec();
                    skip_element(&mut reader, &name)?;
                }
            },
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(entries)
}

/// Consume events until the matching end tag, honoring nesting.
fn skip_element(reader: &mut Reader<&[u8]>, name: &[u8]) -> Result<()> {
    let mut depth = 1usize;
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) if e.name().as_ref() == name => depth += 1,
            Event::End(e) if e.name().as_ref() == name => {
                depth -= 1;
                if depth == 0 {
                    return Ok(());
                }
            }
            Event::Eof => return Err(Error::Xml("unexpected end of document".into())),
            _ => {}
        }
    }
}

/// Collect the text content of the current element up to its end tag.
fn read_text(reader: &mut Reader<&[u8]>, end: &[u8]) -> Result<String> {
    let mut out = String::new();
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Text(t) => out.push_str(&t.unescape().map_err(xml_err)?),
            Event::CData(c) => {
                out.push_str(
                    std::str::from_utf8(&c).map_err(|e| Error::Xml(e.to_string()))?,
                );
            }
            Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                skip_element(reader, &name)?;
            }
            Event::End(e) if e.name().as_ref() == end => return Ok(out),
            Event::End(_) => return Err(Error::Xml("mismatched end tag".into())),
            Event::Eof => return Err(Error::Xml("unexpected end of document".into())),
            _ => {}
        }
    }
}

fn parse_bool(text: &str) -> bool {
    text.eq_ignore_ascii_case("true")
}

fn parse_time(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Xml(format!("bad timestamp {text:?}: {e}")))
}

fn parse_uuid(text: &str) -> Result<Uuid> {
    if text.is_empty() {
        return Ok(Uuid::nil());
    }
    let bytes = BASE64
        .decode(text.trim())
        .map_err(|e| Error::Xml(format!("bad UUID: {e}")))?;
    let bytes: [u8; 16] = bytes
        .try_into()
        .map_err(|_| Error::Xml("UUID must be 16 bytes".into()))?;
    Ok(Uuid::from_bytes(bytes))
}

fn parse_opt_uuid(text: &str) -> Result<Option<Uuid>> {
    let uuid = parse_uuid(text)?;
    Ok(if uuid.is_nil() { None } else { Some(uuid) })
}

fn read_meta(reader: &mut Reader<&[u8]>) -> Result<Meta> {
    let mut meta = Meta::new("");
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                match name.as_slice() {
                    b"MemoryProtection" => {
                        meta.memory_protection = read_memory_protection(reader)?
                    }
                    b"CustomIcons" => meta.custom_icons = read_custom_icons(reader)?,
                    _ => {
                        let text = read_text(reader, &name)?;
                        match name.as_slice() {
                            b"Generator" => meta.generator = text,
                            b"DatabaseName" => meta.database_name = text,
                            b"DatabaseDescription" => meta.database_description = text,
                            b"DefaultUserName" => meta.default_user_name = text,
                            b"MaintenanceHistoryDays" => {
                                meta.maintenance_history_days = text.parse().unwrap_or(
                                    crate::model::meta::DEFAULT_MAINTENANCE_HISTORY_DAYS,
                                )
                            }
                            b"HistoryMaxItems" => {
                                meta.history_max_items = text
                                    .parse()
                                    .unwrap_or(crate::model::meta::DEFAULT_HISTORY_MAX_ITEMS)
                            }
                            b"RecycleBinEnabled" => {
                                meta.recycle_bin_enabled = parse_bool(&text)
                            }
                            b"RecycleBinUUID" => {
                                meta.recycle_bin_uuid = parse_opt_uuid(&text)?
                            }
                            b"RecycleBinChanged" => {
                                meta.recycle_bin_changed = parse_time(&text)?
                            }
                            b"LastSelectedGroup" => {
                                meta.last_selected_group = parse_opt_uuid(&text)?
                            }
                            b"LastTopVisibleGroup" => {
                                meta.last_top_visible_group = parse_opt_uuid(&text)?
                            }
                            _ => {}
                        }
                    }
                }
            }
            Event::End(e) if e.name().as_ref() == b"Meta" => return Ok(meta),
            Event::Eof => return Err(Error::Xml("unexpected end of document".into())),
            _ => {}
        }
    }
}

fn read_memory_protection(reader: &mut Reader<&[u8]>) -> Result<MemoryProtection> {
    let mut mp = MemoryProtection::default();
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                let value = parse_bool(&read_text(reader, &name)?);
                match name.as_slice() {
                    b"ProtectTitle" => mp.protect_title = value,
                    b"ProtectUserName" => mp.protect_user_name = value,
                    b"ProtectPassword" => mp.protect_password = value,
                    b"ProtectURL" => mp.protect_url = value,
                    b"ProtectNotes" => mp.protect_notes = value,
                    _ => {}
                }
            }
            Event::End(e) if e.name().as_ref() == b"MemoryProtection" => return Ok(mp),
            Event::Eof => return Err(Error::Xml("unexpected end of document".into())),
            _ => {}
        }
    }
}

fn read_custom_icons(reader: &mut Reader<&[u8]>) -> Result<Vec<CustomIcon>> {
    let mut icons = Vec::new();
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) if e.name().as_ref() == b"Icon" => {
                let mut uuid = Uuid::nil();
                let mut data = Vec::new();
                loop {
                    match reader.read_event().map_err(xml_err)? {
                        Event::Start(inner) => {
                            let name = inner.name().as_ref().to_vec();
                            let text = read_text(reader, &name)?;
                            match name.as_slice() {
                                b"UUID" => uuid = parse_uuid(&text)?,
                                b"Data" => {
                                    data = BASE64
                                        .decode(text.trim())
                                        .map_err(|e| Error::Xml(format!("icon data: {e}")))?
                                }
                                _ => {}
                            }
                        }
                        Event::End(inner) if inner.name().as_ref() == b"Icon" => break,
                        Event::Eof => {
                            return Err(Error::Xml("unexpected end of document".into()))
                        }
                        _ => {}
                    }
                }
                icons.push(CustomIcon { uuid, data });
            }
            Event::End(e) if e.name().as_ref() == b"CustomIcons" => return Ok(icons),
            Event::Eof => return Err(Error::Xml("unexpected end of document".into())),
            _ => {}
        }
    }
}

fn read_root(reader: &mut Reader<&[u8]>, db: &mut Database, ctx: &mut ReadCtx) -> Result<()> {
    let mut seen_group = false;
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => match e.name().as_ref() {
                b"Group" => {
                    let group = read_group(reader, ctx)?;
                    if seen_group {
                        db.root.groups.push(group);
                    } else {
                        db.root = group;
                        seen_group = true;
                    }
                }
                b"DeletedObjects" => db.deleted_objects = read_deleted_objects(reader)?,
                other => {
                    let name = other.to_vec();
                    skip_element(reader, &name)?;
                }
            },
            Event::End(e) if e.name().as_ref() == b"Root" => return Ok(()),
            Event::Eof => return Err(Error::Xml("unexpected end of document".into())),
            _ => {}
        }
    }
}

fn read_times(reader: &mut Reader<&[u8]>) -> Result<Times> {
    let mut times = Times::new();
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                let text = read_text(reader, &name)?;
                match name.as_slice() {
                    b"CreationTime" => times.creation = parse_time(&text)?,
                    b"LastModificationTime" => times.last_modification = parse_time(&text)?,
                    b"LastAccessTime" => times.last_access = parse_time(&text)?,
                    b"ExpiryTime" => times.expiry = parse_time(&text)?,
                    b"Expires" => times.expires = parse_bool(&text),
                    b"UsageCount" => times.usage_count = text.parse().unwrap_or(0),
                    b"LocationChanged" => times.location_changed = parse_time(&text)?,
                    _ => {}
                }
            }
            Event::End(e) if e.name().as_ref() == b"Times" => return Ok(times),
            Event::Eof => return Err(Error::Xml("unexpected end of document".into())),
            _ => {}
        }
    }
}

fn read_group(reader: &mut Reader<&[u8]>, ctx: &mut ReadCtx) -> Result<Group> {
    let mut group = Group::new("");
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                match name.as_slice() {
                    b"Group" => {
                        let child = read_group(reader, ctx)?;
                        group.groups.push(child);
                    }
                    b"Entry" => {
                        let entry = read_entry(reader, ctx, true)?;
                        group.entries.push(entry);
                    }
                    b"Times" => group.times = read_times(reader)?,
                    _ => {
                        let text = read_text(reader, &name)?;
                        match name.as_slice() {
                            b"UUID" => group.uuid = parse_uuid(&text)?,
                            b"Name" => group.name = text,
                            b"Notes" => group.notes = text,
                            b"IconID" => group.icon_id = text.parse().unwrap_or(0),
                            b"CustomIconUUID" => group.custom_icon = parse_opt_uuid(&text)?,
                            b"IsExpanded" => group.is_expanded = parse_bool(&text),
                            b"DefaultAutoTypeSequence" => {
                                group.default_auto_type_sequence =
                                    if text.is_empty() { None } else { Some(text) }
                            }
                            b"LastTopVisibleEntry" => {
                                group.last_top_visible_entry = parse_opt_uuid(&text)?
                            }
                            _ => {}
                        }
                    }
                }
            }
            Event::End(e) if e.name().as_ref() == b"Group" => return Ok(group),
            Event::Eof => return Err(Error::Xml("unexpected end of document".into())),
            _ => {}
        }
    }
}

fn read_entry(
    reader: &mut Reader<&[u8]>,
    ctx: &mut ReadCtx,
    allow_history: bool,
) -> Result<Entry> {
    let mut entry = Entry::new();
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                match name.as_slice() {
                    b"Times" => entry.times = read_times(reader)?,
                    b"String" => {
                        let (key, value) = read_string_field(reader, ctx)?;
                        entry.fields.set(&key, value);
                    }
                    b"Binary" => {
                        let (key, value) = read_binary_field(reader, ctx)?;
                        entry.set_binary(&key, value);
                    }
                    b"AutoType" => entry.auto_type = read_auto_type(reader)?,
                    b"History" => {
                        if allow_history {
                            entry.history = read_history(reader, ctx)?;
                        } else {
                            // Depth is exactly one; anything deeper is dropped.
                            skip_element(reader, b"History")?;
                        }
                    }
                    _ => {
                        let text = read_text(reader, &name)?;
                        match name.as_slice() {
                            b"UUID" => entry.uuid = parse_uuid(&text)?,
                            b"IconID" => entry.icon_id = text.parse().unwrap_or(0),
                            b"CustomIconUUID" => entry.custom_icon = parse_opt_uuid(&text)?,
                            b"ForegroundColor" => {
                                entry.foreground_color =
                                    if text.is_empty() { None } else { Some(text) }
                            }
                            b"BackgroundColor" => {
                                entry.background_color =
                                    if text.is_empty() { None } else { Some(text) }
                            }
                            b"OverrideURL" => entry.override_url = text,
                            b"Tags" => {
                                entry.tags = text
                                    .split(';')
                                    .filter(|t| !t.is_empty())
                                    .map(str::to_string)
                                    .collect()
                            }
                            _ => {}
                        }
                    }
                }
            }
            Event::End(e) if e.name().as_ref() == b"Entry" => {
                ctx.tick()?;
                return Ok(entry);
            }
            Event::Eof => return Err(Error::Xml("unexpected end of document".into())),
            _ => {}
        }
    }
}

fn read_history(reader: &mut Reader<&[u8]>, ctx: &mut ReadCtx) -> Result<Vec<Entry>> {
    let mut history = Vec::new();
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) if e.name().as_ref() == b"Entry" => {
                history.push(read_entry(reader, ctx, false)?);
            }
            Event::End(e) if e.name().as_ref() == b"History" => return Ok(history),
            Event::Eof => return Err(Error::Xml("unexpected end of document".into())),
            _ => {}
        }
    }
}

fn read_string_field(
    reader: &mut Reader<&[u8]>,
    ctx: &mut ReadCtx,
) -> Result<(String, ProtectedString)> {
    let mut key = String::new();
    let mut value = ProtectedString::plain("");
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                match name.as_slice() {
                    b"Key" => key = read_text(reader, b"Key")?,
                    b"Value" => {
                        let (protected, in_memory) = value_flags(&e)?;
                        let text = read_text(reader, b"Value")?;
                        value = decode_string_value(&text, protected, in_memory, ctx)?;
                    }
                    _ => skip_element(reader, &name)?,
                }
            }
            Event::Empty(e) if e.name().as_ref() == b"Value" => {
                let (protected, in_memory) = value_flags(&e)?;
                value = decode_string_value("", protected, in_memory, ctx)?;
            }
            Event::End(e) if e.name().as_ref() == b"String" => return Ok((key, value)),
            Event::Eof => return Err(Error::Xml("unexpected end of document".into())),
            _ => {}
        }
    }
}

fn value_flags(e: &BytesStart) -> Result<(bool, bool)> {
    let mut protected = false;
    let mut in_memory = false;
    for attr in e.attributes() {
        let attr = attr.map_err(xml_err)?;
        let value = attr.unescape_value().map_err(xml_err)?;
        match attr.key.as_ref() {
            b"Protected" => protected = parse_bool(&value),
            b"ProtectedInMemory" => in_memory = parse_bool(&value),
            _ => {}
        }
    }
    Ok((protected, in_memory))
}

fn decode_string_value(
    text: &str,
    protected: bool,
    in_memory: bool,
    ctx: &mut ReadCtx,
) -> Result<ProtectedString> {
    if protected {
        let Some(stream) = &mut ctx.stream else {
            return Err(Error::Xml(
                "protected value present but no stream key supplied".into(),
            ));
        };
        let mut bytes = BASE64
            .decode(text.trim())
            .map_err(|e| Error::Xml(format!("protected value: {e}")))?;
        stream.apply(&mut bytes);
        let decoded = String::from_utf8(bytes)
            .map_err(|e| Error::Xml(format!("protected value: {e}")))?;
        Ok(ProtectedString::protected(&decoded))
    } else if in_memory {
        Ok(ProtectedString::protected(text))
    } else {
        Ok(ProtectedString::plain(text))
    }
}

fn read_binary_field(
    reader: &mut Reader<&[u8]>,
    ctx: &mut ReadCtx,
) -> Result<(String, ProtectedBinary)> {
    let mut key = String::new();
    let mut value = ProtectedBinary::plain(&[]);
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                match name.as_slice() {
                    b"Key" => key = read_text(reader, b"Key")?,
                    b"Value" => {
                        let (protected, in_memory) = value_flags(&e)?;
                        let text = read_text(reader, b"Value")?;
                        let mut bytes = BASE64
                            .decode(text.trim())
                            .map_err(|e| Error::Xml(format!("binary value: {e}")))?;
                        value = if protected {
                            let Some(stream) = &mut ctx.stream else {
                                return Err(Error::Xml(
                                    "protected value present but no stream key supplied".into(),
                                ));
                            };
                            stream.apply(&mut bytes);
                            ProtectedBinary::protected(&bytes)
                        } else if in_memory {
                            ProtectedBinary::protected(&bytes)
                        } else {
                            ProtectedBinary::plain(&bytes)
                        };
                    }
                    _ => skip_element(reader, &name)?,
                }
            }
            Event::End(e) if e.name().as_ref() == b"Binary" => return Ok((key, value)),
            Event::Eof => return Err(Error::Xml("unexpected end of document".into())),
            _ => {}
        }
    }
}

fn read_auto_type(reader: &mut Reader<&[u8]>) -> Result<AutoType> {
    let mut auto_type = AutoType::default();
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                match name.as_slice() {
                    b"Association" => {
                        let mut window = String::new();
                        let mut sequence = None;
                        loop {
                            match reader.read_event().map_err(xml_err)? {
                                Event::Start(inner) => {
                                    let inner_name = inner.name().as_ref().to_vec();
                                    let text = read_text(reader, &inner_name)?;
                                    match inner_name.as_slice() {
                                        b"Window" => window = text,
                                        b"KeystrokeSequence" => sequence = Some(text),
                                        _ => {}
                                    }
                                }
                                Event::End(inner)
                                    if inner.name().as_ref() == b"Association" =>
                                {
                                    break
                                }
                                Event::Eof => {
                                    return Err(Error::Xml(
                                        "unexpected end of document".into(),
                                    ))
                                }
                                _ => {}
                            }
                        }
                        auto_type
                            .associations
                            .push(AutoTypeAssociation { window, sequence });
                    }
                    _ => {
                        let text = read_text(reader, &name)?;
                        match name.as_slice() {
                            b"Enabled" => auto_type.enabled = parse_bool(&text),
                            b"DataTransferObfuscation" => {
                                auto_type.obfuscation = text.parse().unwrap_or(0)
                            }
                            b"DefaultSequence" => {
                                auto_type.default_sequence =
                                    if text.is_empty() { None } else { Some(text) }
                            }
                            _ => {}
                        }
                    }
                }
            }
            Event::End(e) if e.name().as_ref() == b"AutoType" => return Ok(auto_type),
            Event::Eof => return Err(Error::Xml("unexpected end of document".into())),
            _ => {}
        }
    }
}

fn read_deleted_objects(reader: &mut Reader<&[u8]>) -> Result<Vec<DeletedObject>> {
    let mut objects = Vec::new();
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) if e.name().as_ref() == b"DeletedObject" => {
                let mut uuid = Uuid::nil();
                let mut deletion_time = crate::model::times::now();
                loop {
                    match reader.read_event().map_err(xml_err)? {
                        Event::Start(inner) => {
                            let name = inner.name().as_ref().to_vec();
                            let text = read_text(reader, &name)?;
                            match name.as_slice() {
                                b"UUID" => uuid = parse_uuid(&text)?,
                                b"DeletionTime" => deletion_time = parse_time(&text)?,
                                _ => {}
                            }
                        }
                        Event::End(inner) if inner.name().as_ref() == b"DeletedObject" => {
                            break
                        }
                        Event::Eof => {
                            return Err(Error::Xml("unexpected end of document".into()))
                        }
                        _ => {}
                    }
                }
                objects.push(DeletedObject {
                    uuid,
                    deletion_time,
                });
            }
            Event::End(e) if e.name().as_ref() == b"DeletedObjects" => return Ok(objects),
            Event::Eof => return Err(Error::Xml("unexpected end of document".into())),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::entry::{KEY_PASSWORD, KEY_TITLE, KEY_USER_NAME};
    use crate::status::NullStatusLogger;

    fn sample_db() -> Database {
        let mut db = Database::new("Passwords");
        db.meta.database_description = "family accounts".into();
        db.meta.default_user_name = "anna".into();

        let mut group = Group::new("Email");
        let mut entry = Entry::new();
        entry.fields.set(KEY_TITLE, ProtectedString::plain("Mail"));
        entry
            .fields
            .set(KEY_USER_NAME, ProtectedString::plain("anna@example.org"));
        entry
            .fields
            .set(KEY_PASSWORD, ProtectedString::protected("tr0ub4dor&3"));
        entry
            .fields
            .set("PIN", ProtectedString::protected("8812"));
        entry.tags = vec!["mail".into(), "personal".into()];
        entry.set_binary("note.txt", ProtectedBinary::protected(b"attachment body"));
        entry.create_backup();
        entry
            .fields
            .set(KEY_PASSWORD, ProtectedString::protected("correct horse"));
        group.entries.push(entry);
        db.root.groups.push(group);
        db.add_tombstone(Uuid::new_v4(), crate::model::times::now());
        db
    }

    fn roundtrip(db: &Database, stream_key: Option<&[u8; 32]>) -> Database {
        let mut buf = Vec::new();
        write_document(db, stream_key, XmlOptions::default(), &NullStatusLogger, &mut buf)
            .unwrap();
        read_document(&buf, stream_key, &NullStatusLogger).unwrap()
    }

    #[test]
    fn document_round_trip_preserves_tree() {
        let db = sample_db();
        let key = [0x31u8; 32];
        let back = roundtrip(&db, Some(&key));
        assert_eq!(back, db);
    }

    #[test]
    fn round_trip_without_stream_key() {
        let db = sample_db();
        assert_eq!(roundtrip(&db, None), db);
    }

    #[test]
    fn protected_values_are_not_plaintext_in_output() {
        let db = sample_db();
        let key = [0x31u8; 32];
        let mut buf = Vec::new();
        write_document(&db, Some(&key), XmlOptions::default(), &NullStatusLogger, &mut buf)
            .unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(!text.contains("correct horse"));
        assert!(!text.contains("tr0ub4dor&3"));
        assert!(!text.contains("8812"));
        assert!(text.contains("Protected=\"True\""));
        // Unprotected fields stay literal.
        assert!(text.contains("anna@example.org"));
    }

    #[test]
    fn entry_list_round_trip() {
        let db = sample_db();
        let entries = db.root.groups[0].entries.clone();
        let mut buf = Vec::new();
        write_entry_list(&entries, &mut buf).unwrap();
        let back = read_entry_list(&buf).unwrap();
        assert_eq!(back, entries);
    }

    #[test]
    fn history_nesting_depth_is_one() {
        let db = sample_db();
        let key = [9u8; 32];
        let back = roundtrip(&db, Some(&key));
        let entry = &back.root.groups[0].entries[0];
        assert_eq!(entry.history.len(), 1);
        assert!(entry.history[0].history.is_empty());
    }

    #[test]
    fn legacy_charset_remaps_unprotected_text() {
        let mut db = sample_db();
        db.root.groups[0].entries[0]
            .fields
            .set(KEY_TITLE, ProtectedString::plain("Почта"));
        let key = [2u8; 32];
        let mut buf = Vec::new();
        write_document(
            &db,
            Some(&key),
            XmlOptions {
                legacy_charset: true,
            },
            &NullStatusLogger,
            &mut buf,
        )
        .unwrap();
        let back = read_document(&buf, Some(&key), &NullStatusLogger).unwrap();
        assert_eq!(
            *back.root.groups[0].entries[0]
                .fields
                .get(KEY_TITLE)
                .unwrap()
                .read(),
            "?????"
        );
    }

    #[test]
    fn unknown_elements_are_skipped() {
        let xml = "<?xml version=\"1.0\"?><KeePassFile><Meta>\
                   <DatabaseName>X</DatabaseName><FutureFeature><Inner>1</Inner></FutureFeature>\
                   </Meta><Root><Group><UUID></UUID><Name>Root</Name></Group>\
                   <DeletedObjects></DeletedObjects></Root></KeePassFile>";
        let db = read_document(xml.as_bytes(), None, &NullStatusLogger).unwrap();
        assert_eq!(db.meta.database_name, "X");
        assert_eq!(db.root.name, "Root");
    }

    #[test]
    fn cancellation_aborts_the_write() {
        let db = sample_db();
        let logger = crate::status::test_support::CancelAfter::new(0);
        let mut buf = Vec::new();
        let err = write_document(&db, None, XmlOptions::default(), &logger, &mut buf)
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
