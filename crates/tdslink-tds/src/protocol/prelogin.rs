//! Prelogin message codec.
//!
//! A prelogin message is a directory of 5-byte entries
//! (`tag`, big-endian `offset`, big-endian `length`) closed by `0xFF`, followed
//! by the option payloads. Offsets count from the first directory byte.

#![allow(clippy::cast_possible_truncation)]

use tdslink_core::error::{
    EncryptionError, EncryptionErrorKind, Error, ProtocolError, ProtocolErrorKind, Result,
};

use crate::protocol::{PacketReader, PacketWriter};

/// Number of option kinds a client sends.
pub const OPTION_COUNT: usize = 7;

/// Bytes taken by one directory entry.
pub const DIRECTORY_ENTRY_SIZE: usize = 5;

/// Upper bound on the encoded message.
pub const MAX_PRELOGIN_LENGTH: usize = OPTION_COUNT * DIRECTORY_ENTRY_SIZE + 1024;

/// Instance option result byte meaning "no such instance".
pub const INSTANCE_FAILURE: u8 = 0x01;

/// Prelogin option tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PreloginOption {
    Version,
    Encryption,
    Instance,
    ThreadId,
    Mars,
    TraceId,
    FedAuthRequired,
    Terminator,
    Unknown(u8),
}

impl PreloginOption {
    pub const fn from_byte(b: u8) -> Self {
        match b {
            0 => PreloginOption::Version,
            1 => PreloginOption::Encryption,
            2 => PreloginOption::Instance,
            3 => PreloginOption::ThreadId,
            4 => PreloginOption::Mars,
            5 => PreloginOption::TraceId,
            6 => PreloginOption::FedAuthRequired,
            0xFF => PreloginOption::Terminator,
            other => PreloginOption::Unknown(other),
        }
    }

    pub const fn as_byte(self) -> u8 {
        match self {
            PreloginOption::Version => 0,
            PreloginOption::Encryption => 1,
            PreloginOption::Instance => 2,
            PreloginOption::ThreadId => 3,
            PreloginOption::Mars => 4,
            PreloginOption::TraceId => 5,
            PreloginOption::FedAuthRequired => 6,
            PreloginOption::Terminator => 0xFF,
            PreloginOption::Unknown(b) => b,
        }
    }
}

/// Encryption setting, both as sent on the wire and as negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncryptionOption {
    Off,
    On,
    NotSupported,
    Required,
    /// Encrypt only the login exchange. Never sent on the wire.
    LoginOnly,
}

impl EncryptionOption {
    /// Decode a wire value. Returns `None` for values outside the protocol.
    pub const fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(EncryptionOption::Off),
            1 => Some(EncryptionOption::On),
            2 => Some(EncryptionOption::NotSupported),
            3 => Some(EncryptionOption::Required),
            _ => None,
        }
    }

    pub const fn as_byte(self) -> u8 {
        match self {
            EncryptionOption::Off | EncryptionOption::LoginOnly => 0,
            EncryptionOption::On => 1,
            EncryptionOption::NotSupported => 2,
            EncryptionOption::Required => 3,
        }
    }
}

/// Combine the client's intent with the server's answer.
///
/// | client \ server | Off       | On  | Required | NotSupported |
/// |-----------------|-----------|-----|----------|--------------|
/// | Off             | LoginOnly | Off | On       | error        |
/// | On              | On        | On  | On       | error        |
/// | NotSupported    | NotSup    | NotSup | error | error        |
pub fn negotiate_encryption(
    client: EncryptionOption,
    server: EncryptionOption,
) -> Result<EncryptionOption> {
    use EncryptionOption::{LoginOnly, NotSupported, Off, On, Required};

    match (client, server) {
        (_, NotSupported) => Err(Error::Encryption(EncryptionError {
            kind: EncryptionErrorKind::NotSupportedByServer,
            message: "Encryption not supported by server".to_string(),
        })),
        (Off, Off) => Ok(LoginOnly),
        (Off, Required) => Ok(On),
        (NotSupported, Required) => Err(Error::Encryption(EncryptionError {
            kind: EncryptionErrorKind::NotSupportedByClient,
            message: "Server requires encryption but it is not supported by the client"
                .to_string(),
        })),
        (Required, _) => Ok(On),
        (current, _) => Ok(current),
    }
}

/// Driver version advertised in the VERSION option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreloginVersion {
    pub major: u8,
    pub minor: u8,
    pub build: u16,
    pub sub_build: u16,
}

impl PreloginVersion {
    pub const ENCODED_LEN: usize = 6;

    /// Version of this crate.
    pub fn current() -> Self {
        Self {
            major: env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
            minor: env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
            build: env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0),
            sub_build: 0,
        }
    }

    fn encode(&self, out: &mut PacketWriter) {
        out.write_u8(self.major);
        out.write_u8(self.minor);
        out.write_u16_be(self.build);
        out.write_u16_le(self.sub_build);
    }

    fn decode(data: &[u8]) -> Option<Self> {
        let mut r = PacketReader::new(data);
        Some(Self {
            major: r.read_u8()?,
            minor: r.read_u8()?,
            build: r.read_u16_be()?,
            sub_build: r.read_u16_le()?,
        })
    }
}

/// Connection and activity identifiers sent for server-side tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceId {
    pub connection_id: [u8; 16],
    pub activity_id: [u8; 16],
    pub sequence: u32,
}

impl TraceId {
    pub const ENCODED_LEN: usize = 36;

    fn encode(&self, out: &mut PacketWriter) {
        out.write_bytes(&self.connection_id);
        out.write_bytes(&self.activity_id);
        out.write_u32_le(self.sequence);
    }

    fn decode(data: &[u8]) -> Option<Self> {
        let mut r = PacketReader::new(data);
        Some(Self {
            connection_id: r.read_array()?,
            activity_id: r.read_array()?,
            sequence: r.read_u32_le()?,
        })
    }
}

/// A prelogin message. Options left as `None` are not written.
///
/// Single-byte options keep their raw wire value; interpretation belongs
/// to the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreloginMessage {
    pub version: Option<PreloginVersion>,
    pub encryption: Option<u8>,
    pub instance: Option<Vec<u8>>,
    pub thread_id: Option<u32>,
    pub mars: Option<u8>,
    pub trace_id: Option<TraceId>,
    pub fed_auth_required: Option<u8>,
}

fn malformed(message: impl Into<String>, raw: Option<Vec<u8>>) -> Error {
    Error::Protocol(ProtocolError {
        kind: ProtocolErrorKind::Malformed,
        message: message.into(),
        raw_data: raw,
        source: None,
    })
}

impl PreloginMessage {
    /// Collect `(tag, payload)` pairs in tag order.
    fn options(&self) -> Vec<(PreloginOption, Vec<u8>)> {
        let mut options = Vec::with_capacity(OPTION_COUNT);
        if let Some(version) = &self.version {
            let mut w = PacketWriter::with_capacity(PreloginVersion::ENCODED_LEN);
            version.encode(&mut w);
            options.push((PreloginOption::Version, w.into_bytes()));
        }
        if let Some(encryption) = self.encryption {
            options.push((PreloginOption::Encryption, vec![encryption]));
        }
        if let Some(instance) = &self.instance {
            options.push((PreloginOption::Instance, instance.clone()));
        }
        if let Some(thread_id) = self.thread_id {
            options.push((PreloginOption::ThreadId, thread_id.to_be_bytes().to_vec()));
        }
        if let Some(mars) = self.mars {
            options.push((PreloginOption::Mars, vec![mars]));
        }
        if let Some(trace_id) = &self.trace_id {
            let mut w = PacketWriter::with_capacity(TraceId::ENCODED_LEN);
            trace_id.encode(&mut w);
            options.push((PreloginOption::TraceId, w.into_bytes()));
        }
        if let Some(fed_auth) = self.fed_auth_required {
            options.push((PreloginOption::FedAuthRequired, vec![fed_auth]));
        }
        options
    }

    /// Encode into the option directory (terminator included) and the payload region.
    pub fn encode_parts(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let options = self.options();
        let directory_len = options.len() * DIRECTORY_ENTRY_SIZE + 1;
        let payload_len: usize = options.iter().map(|(_, p)| p.len()).sum();
        if directory_len + payload_len > MAX_PRELOGIN_LENGTH {
            return Err(Error::Protocol(ProtocolError {
                kind: ProtocolErrorKind::InvalidValue,
                message: format!(
                    "prelogin message of {} bytes exceeds the {MAX_PRELOGIN_LENGTH} byte limit",
                    directory_len + payload_len
                ),
                raw_data: None,
                source: None,
            }));
        }

        let mut directory = PacketWriter::with_capacity(directory_len);
        let mut payload = PacketWriter::with_capacity(payload_len);
        let mut offset = directory_len;
        for (tag, data) in &options {
            directory.write_u8(tag.as_byte());
            directory.write_u16_be(offset as u16);
            directory.write_u16_be(data.len() as u16);
            payload.write_bytes(data);
            offset += data.len();
        }
        directory.write_u8(PreloginOption::Terminator.as_byte());
        Ok((directory.into_bytes(), payload.into_bytes()))
    }

    /// Encode into one contiguous buffer.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let (mut directory, payload) = self.encode_parts()?;
        directory.extend_from_slice(&payload);
        Ok(directory)
    }

    /// Decode a prelogin message.
    ///
    /// Options a client never acts on (VERSION, THREADID, TRACEID) are kept
    /// only when their payload is well formed; a bad entry for one of them
    /// leaves the field `None`. Every other known option must point inside
    /// the message.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut msg = PreloginMessage::default();

        for entry in directory(data) {
            let entry = entry?;
            match entry.option {
                PreloginOption::Version => {
                    msg.version = entry.payload(data).ok().and_then(PreloginVersion::decode);
                }
                PreloginOption::Encryption => msg.encryption = Some(entry.first_byte(data)?),
                PreloginOption::Instance => msg.instance = Some(entry.payload(data)?.to_vec()),
                PreloginOption::ThreadId => {
                    msg.thread_id = entry
                        .payload(data)
                        .ok()
                        .and_then(|payload| PacketReader::new(payload).read_u32_be());
                }
                PreloginOption::Mars => msg.mars = Some(entry.first_byte(data)?),
                PreloginOption::TraceId => {
                    msg.trace_id = entry.payload(data).ok().and_then(TraceId::decode);
                }
                PreloginOption::FedAuthRequired => {
                    msg.fed_auth_required = Some(entry.first_byte(data)?);
                }
                PreloginOption::Unknown(_) | PreloginOption::Terminator => {}
            }
        }

        Ok(msg)
    }
}

/// One option directory entry. Offsets count from the start of the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionEntry {
    pub option: PreloginOption,
    pub offset: usize,
    pub length: usize,
}

impl OptionEntry {
    /// The entry's payload, checked against the message bounds.
    pub fn payload<'a>(&self, data: &'a [u8]) -> Result<&'a [u8]> {
        let end = self.offset + self.length;
        data.get(self.offset..end).ok_or_else(|| {
            malformed(
                format!(
                    "prelogin option {:#04x} points at {}..{end} beyond {} byte message",
                    self.option.as_byte(),
                    self.offset,
                    data.len()
                ),
                Some(vec![self.option.as_byte()]),
            )
        })
    }

    /// The byte at the entry's offset. Single-byte options ignore the length.
    pub fn first_byte(&self, data: &[u8]) -> Result<u8> {
        data.get(self.offset).copied().ok_or_else(|| {
            malformed(
                format!(
                    "prelogin option {:#04x} offset {} beyond {} byte message",
                    self.option.as_byte(),
                    self.offset,
                    data.len()
                ),
                Some(vec![self.option.as_byte()]),
            )
        })
    }
}

/// Walk the option directory of `data` in wire order.
///
/// Every tag, known or not, is followed by a 4-byte offset/length entry.
/// Running out of bytes where a tag is expected ends the directory just like
/// the terminator does; running out inside an entry yields one error.
pub fn directory(data: &[u8]) -> Directory<'_> {
    Directory {
        reader: PacketReader::new(data),
        done: false,
    }
}

/// Iterator returned by [`directory`].
#[derive(Debug)]
pub struct Directory<'a> {
    reader: PacketReader<'a>,
    done: bool,
}

impl Iterator for Directory<'_> {
    type Item = Result<OptionEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let option = match self.reader.read_u8().map(PreloginOption::from_byte) {
            None | Some(PreloginOption::Terminator) => {
                self.done = true;
                return None;
            }
            Some(option) => option,
        };
        let (Some(offset), Some(length)) = (self.reader.read_u16_be(), self.reader.read_u16_be())
        else {
            self.done = true;
            return Some(Err(malformed(
                format!(
                    "truncated prelogin directory entry for option {:#04x}",
                    option.as_byte()
                ),
                Some(vec![option.as_byte()]),
            )));
        };
        if let PreloginOption::Unknown(tag) = option {
            tracing::trace!(tag, offset, length, "skipping unknown prelogin option");
        }
        Some(Ok(OptionEntry {
            option,
            offset: usize::from(offset),
            length: usize::from(length),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::EncryptionOption::{LoginOnly, NotSupported, Off, On, Required};

    fn full_message() -> PreloginMessage {
        PreloginMessage {
            version: Some(PreloginVersion {
                major: 1,
                minor: 2,
                build: 0x0304,
                sub_build: 0x0506,
            }),
            encryption: Some(0),
            instance: Some(vec![0]),
            thread_id: Some(0xDEAD_BEEF),
            mars: Some(1),
            trace_id: Some(TraceId {
                connection_id: [0x11; 16],
                activity_id: [0x22; 16],
                sequence: 7,
            }),
            fed_auth_required: Some(1),
        }
    }

    #[test]
    fn roundtrip_full_message() {
        let msg = full_message();
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes.len(), 7 * 5 + 1 + 6 + 1 + 1 + 4 + 1 + 36 + 1);
        assert_eq!(PreloginMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn roundtrip_without_fed_auth() {
        let mut msg = full_message();
        msg.fed_auth_required = None;
        let bytes = msg.encode().unwrap();
        // Six entries, so payloads start right after a 31 byte directory.
        assert_eq!(&bytes[1..3], &[0x00, 31]);
        assert_eq!(PreloginMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn directory_layout() {
        let msg = full_message();
        let (directory, payload) = msg.encode_parts().unwrap();
        assert_eq!(directory.len(), 36);
        assert_eq!(*directory.last().unwrap(), 0xFF);
        // VERSION at offset 36, length 6
        assert_eq!(&directory[0..5], &[0x00, 0x00, 36, 0x00, 6]);
        // ENCRYPTION right behind it
        assert_eq!(&directory[5..10], &[0x01, 0x00, 42, 0x00, 1]);
        // version payload: major, minor, build BE, sub-build LE
        assert_eq!(&payload[0..6], &[1, 2, 0x03, 0x04, 0x06, 0x05]);
        // thread id is big-endian
        assert_eq!(&payload[8..12], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn decode_tolerates_missing_terminator() {
        let bytes = [0x01, 0x00, 0x05, 0x00, 0x01, 0x03];
        let msg = PreloginMessage::decode(&bytes).unwrap();
        assert_eq!(msg.encryption, Some(3));
    }

    #[test]
    fn decode_skips_unknown_options() {
        // unknown tag 0x42 then MARS
        let bytes = [
            0x42, 0x00, 0x0B, 0x00, 0x02, // unknown
            0x04, 0x00, 0x0D, 0x00, 0x01, // MARS
            0xFF, 0xAA, 0xBB, 0x01,
        ];
        let msg = PreloginMessage::decode(&bytes).unwrap();
        assert_eq!(msg.mars, Some(1));
    }

    #[test]
    fn decode_rejects_out_of_range_offset() {
        let bytes = [0x01, 0x00, 0x40, 0x00, 0x01, 0xFF];
        let err = PreloginMessage::decode(&bytes).unwrap_err();
        match err {
            Error::Protocol(p) => assert_eq!(p.kind, ProtocolErrorKind::Malformed),
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn decode_ignores_bad_entries_for_unused_options() {
        // VERSION points far outside the message, ENCRYPTION is valid
        let bytes = [
            0x00, 0x00, 0x40, 0x00, 0x06, // VERSION at 64
            0x01, 0x00, 0x0B, 0x00, 0x01, // ENCRYPTION at 11
            0xFF, 0x00,
        ];
        let msg = PreloginMessage::decode(&bytes).unwrap();
        assert_eq!(msg.version, None);
        assert_eq!(msg.encryption, Some(0));

        let trace = [0x05, 0x00, 0x06, 0x00, 0x24, 0xFF, 0x01];
        assert_eq!(PreloginMessage::decode(&trace).unwrap().trace_id, None);
    }

    #[test]
    fn directory_walks_in_wire_order() {
        let bytes = [
            0x04, 0x00, 0x10, 0x00, 0x01, // MARS
            0x42, 0x00, 0x00, 0x00, 0x00, // unknown
            0x01, 0x00, 0x11, 0x00, 0x01, // ENCRYPTION
            0xFF, 0x01, 0x02,
        ];
        let options: Vec<PreloginOption> = directory(&bytes)
            .map(|entry| entry.unwrap().option)
            .collect();
        assert_eq!(
            options,
            vec![
                PreloginOption::Mars,
                PreloginOption::Unknown(0x42),
                PreloginOption::Encryption
            ]
        );
    }

    #[test]
    fn truncated_directory_entry_is_malformed() {
        let mut entries = directory(&[0x04, 0x00]);
        assert!(matches!(entries.next(), Some(Err(Error::Protocol(_)))));
        assert!(entries.next().is_none());
    }

    #[test]
    fn decode_empty_thread_id_from_server() {
        let bytes = [0x03, 0x00, 0x06, 0x00, 0x00, 0xFF];
        let msg = PreloginMessage::decode(&bytes).unwrap();
        assert_eq!(msg.thread_id, None);
    }

    #[test]
    fn oversized_message_is_rejected() {
        let msg = PreloginMessage {
            instance: Some(vec![b'x'; 2000]),
            ..PreloginMessage::default()
        };
        assert!(msg.encode().is_err());
    }

    #[test]
    fn encryption_lattice() {
        assert_eq!(negotiate_encryption(Off, Off).unwrap(), LoginOnly);
        assert_eq!(negotiate_encryption(Off, Required).unwrap(), On);
        assert_eq!(negotiate_encryption(Off, On).unwrap(), Off);
        for server in [Off, On, Required] {
            assert_eq!(negotiate_encryption(On, server).unwrap(), On);
        }
        assert_eq!(negotiate_encryption(NotSupported, Off).unwrap(), NotSupported);
        assert_eq!(negotiate_encryption(NotSupported, On).unwrap(), NotSupported);

        match negotiate_encryption(NotSupported, Required).unwrap_err() {
            Error::Encryption(e) => {
                assert_eq!(e.kind, EncryptionErrorKind::NotSupportedByClient);
            }
            other => panic!("unexpected {other:?}"),
        }
        for client in [Off, On, NotSupported] {
            match negotiate_encryption(client, NotSupported).unwrap_err() {
                Error::Encryption(e) => {
                    assert_eq!(e.kind, EncryptionErrorKind::NotSupportedByServer);
                    assert_eq!(e.message, "Encryption not supported by server");
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn encryption_wire_values() {
        for b in 0..=3u8 {
            assert_eq!(EncryptionOption::from_byte(b).unwrap().as_byte(), b);
        }
        assert_eq!(EncryptionOption::from_byte(0x80), None);
        assert_eq!(LoginOnly.as_byte(), 0);
    }
}
