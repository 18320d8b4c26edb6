//! TLS ClientHello SNI extraction
//!
//! Decodes the leading bytes of a TCP stream as a single TLS record
//! and pulls the hostname out of the ClientHello's server_name
//! extension. No reassembly: a ClientHello split across records is
//! treated as unparseable.

/// TLS record type: handshake
const RECORD_HANDSHAKE: u8 = 0x16;
/// Handshake message type: ClientHello
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
/// Extension type: server_name
const EXT_SERVER_NAME: u16 = 0x0000;
/// server_name entry type: host_name
const NAME_TYPE_HOST: u8 = 0x00;

/// Bounds-checked byte reader
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        if end > self.data.len() {
            return None;
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }
}

/// Extract the SNI hostname from the first TLS record of a stream.
///
/// Returns `None` for anything that is not a complete ClientHello
/// with a host_name server_name entry.
pub fn parse_sni(data: &[u8]) -> Option<String> {
    let mut record = Reader::new(data);

    if record.u8()? != RECORD_HANDSHAKE {
        return None;
    }
    record.take(2)?; // record protocol version
    let record_len = record.u16()? as usize;
    let payload = record.take(record_len)?;

    let mut hello = Reader::new(payload);
    if hello.u8()? != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    let body_len =
        u32::from_be_bytes([0, hello.u8()?, hello.u8()?, hello.u8()?]) as usize;
    let body = hello.take(body_len)?;

    let mut r = Reader::new(body);
    r.take(2)?; // client version
    r.take(32)?; // random
    let session_id_len = r.u8()? as usize;
    r.take(session_id_len)?;
    let cipher_suites_len = r.u16()? as usize;
    r.take(cipher_suites_len)?;
    let compression_len = r.u8()? as usize;
    r.take(compression_len)?;

    let extensions_len = r.u16()? as usize;
    let mut extensions = Reader::new(r.take(extensions_len)?);

    loop {
        let ext_type = extensions.u16()?;
        let ext_len = extensions.u16()? as usize;
        let ext_data = extensions.take(ext_len)?;

        if ext_type != EXT_SERVER_NAME {
            continue;
        }

        let mut names = Reader::new(ext_data);
        let list_len = names.u16()? as usize;
        let mut list = Reader::new(names.take(list_len)?);
        loop {
            let name_type = list.u8()?;
            let name_len = list.u16()? as usize;
            let name = list.take(name_len)?;
            if name_type == NAME_TYPE_HOST {
                return String::from_utf8(name.to_vec()).ok();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal ClientHello record carrying one SNI entry.
    fn client_hello(hostname: &str) -> Vec<u8> {
        let name = hostname.as_bytes();

        // server_name extension data
        let mut sni = Vec::new();
        sni.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes()); // list length
        sni.push(NAME_TYPE_HOST);
        sni.extend_from_slice(&(name.len() as u16).to_be_bytes());
        sni.extend_from_slice(name);

        let mut extensions = Vec::new();
        // a padding-ish extension first, so the scan has to skip one
        extensions.extend_from_slice(&0x000au16.to_be_bytes()); // supported_groups
        extensions.extend_from_slice(&2u16.to_be_bytes());
        extensions.extend_from_slice(&[0x00, 0x1d]);
        // server_name
        extensions.extend_from_slice(&EXT_SERVER_NAME.to_be_bytes());
        extensions.extend_from_slice(&(sni.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&sni);

        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // TLS 1.2
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session id
        body.extend_from_slice(&2u16.to_be_bytes()); // cipher suites
        body.extend_from_slice(&[0x13, 0x01]);
        body.push(1); // compression methods
        body.push(0);
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = Vec::new();
        handshake.push(HANDSHAKE_CLIENT_HELLO);
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = Vec::new();
        record.push(RECORD_HANDSHAKE);
        record.extend_from_slice(&[0x03, 0x01]);
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn test_parses_hostname() {
        let bytes = client_hello("example.com");
        assert_eq!(parse_sni(&bytes).as_deref(), Some("example.com"));
    }

    #[test]
    fn test_not_a_tls_record() {
        assert!(parse_sni(b"GET / HTTP/1.1\r\n").is_none());
        assert!(parse_sni(&[]).is_none());
    }

    #[test]
    fn test_not_a_client_hello() {
        let mut bytes = client_hello("example.com");
        // Flip the handshake type to ServerHello.
        bytes[5] = 0x02;
        assert!(parse_sni(&bytes).is_none());
    }

    #[test]
    fn test_truncated_record() {
        let bytes = client_hello("example.com");
        for cut in [3, 10, 40, bytes.len() - 1] {
            assert!(parse_sni(&bytes[..cut]).is_none(), "cut at {}", cut);
        }
    }

    #[test]
    fn test_no_sni_extension() {
        let mut bytes = client_hello("x");
        // Rewrite the server_name extension type (last extension, 10
        // bytes from the tail) so the scan misses it.
        let pos = bytes.len() - 10;
        bytes[pos] = 0xff;
        assert!(parse_sni(&bytes).is_none());
    }
}
