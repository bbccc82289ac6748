use crate::dns::types::{DnsClass, RecordType, ResponseCode};

/// Raw DNS packet parser - binary level parsing per RFC 1035.
/// Everything the resolver needs is hand-parsed from &[u8].

#[derive(Debug, Clone)]
pub struct DnsHeader {
    pub id: u16,
    pub qr: bool, // Query/Response flag
    pub opcode: u8,
    pub aa: bool, // Authoritative Answer
    pub tc: bool, // Truncated
    pub rd: bool, // Recursion Desired
    pub ra: bool, // Recursion Available
    pub rcode: ResponseCode,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

#[derive(Debug, Clone)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: RecordType,
    pub qclass: DnsClass,
}

#[derive(Debug, Clone)]
pub struct DnsRecord {
    pub name: String,
    pub rtype: RecordType,
    pub rclass: DnsClass,
    pub ttl: u32,
    pub rdata: Vec<u8>,
    /// Offset of rdata within the packet (compression pointer resolution)
    pub rdata_offset: usize,
}

#[derive(Debug, Clone)]
pub struct DnsPacket {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub additionals: Vec<DnsRecord>,
    pub raw: Vec<u8>,
}

/// Parse a DNS name from raw bytes with label compression support (RFC 1035 §4.1.4)
pub fn parse_name(data: &[u8], offset: &mut usize) -> anyhow::Result<String> {
    let mut labels = Vec::new();
    let mut jumped = false;
    let mut pos = *offset;
    let mut jumps_performed = 0;
    const MAX_JUMPS: usize = 10; // Prevent infinite loops

    loop {
        if pos >= data.len() {
            return Err(anyhow::anyhow!(
                "DNS name parse: unexpected end of data at offset {}",
                pos
            ));
        }

        let len_byte = data[pos];

        // Pointer (compression) - top 2 bits are 11
        if (len_byte & 0xC0) == 0xC0 {
            if pos + 1 >= data.len() {
                return Err(anyhow::anyhow!(
                    "DNS name parse: truncated pointer at offset {}",
                    pos
                ));
            }
            if !jumped {
                // Where to continue reading after this name
                *offset = pos + 2;
                jumped = true;
            }
            let pointer = ((len_byte as u16 & 0x3F) << 8) | data[pos + 1] as u16;
            pos = pointer as usize;
            jumps_performed += 1;
            if jumps_performed > MAX_JUMPS {
                return Err(anyhow::anyhow!("DNS name parse: too many jumps (possible loop)"));
            }
            continue;
        }

        if len_byte == 0 {
            // End of name
            if !jumped {
                *offset = pos + 1;
            }
            break;
        }

        let label_len = len_byte as usize;
        pos += 1;

        if pos + label_len > data.len() {
            return Err(anyhow::anyhow!("DNS name parse: label extends beyond packet"));
        }

        let label = String::from_utf8_lossy(&data[pos..pos + label_len]).to_string();
        labels.push(label);
        pos += label_len;
    }

    Ok(labels.join("."))
}

/// Parse a domain name starting at a known offset within the full packet.
/// Used to pull CNAME targets out of rdata, which may carry compression pointers.
pub fn parse_name_at_offset(full_packet: &[u8], offset: usize) -> anyhow::Result<String> {
    let mut pos = offset;
    parse_name(full_packet, &mut pos)
}

/// Parse a complete DNS packet from raw bytes
pub fn parse_packet(data: &[u8]) -> anyhow::Result<DnsPacket> {
    if data.len() < 12 {
        return Err(anyhow::anyhow!(
            "DNS packet too short: {} bytes (minimum 12)",
            data.len()
        ));
    }

    // Header (12 bytes)
    let id = u16::from_be_bytes([data[0], data[1]]);
    let flags = u16::from_be_bytes([data[2], data[3]]);
    let qdcount = u16::from_be_bytes([data[4], data[5]]);
    let ancount = u16::from_be_bytes([data[6], data[7]]);
    let nscount = u16::from_be_bytes([data[8], data[9]]);
    let arcount = u16::from_be_bytes([data[10], data[11]]);

    let header = DnsHeader {
        id,
        qr: (flags >> 15) & 1 == 1,
        opcode: ((flags >> 11) & 0xF) as u8,
        aa: (flags >> 10) & 1 == 1,
        tc: (flags >> 9) & 1 == 1,
        rd: (flags >> 8) & 1 == 1,
        ra: (flags >> 7) & 1 == 1,
        rcode: ResponseCode::from((flags & 0xF) as u8),
        qdcount,
        ancount,
        nscount,
        arcount,
    };

    let mut offset = 12;

    let mut questions = Vec::new();
    for _ in 0..qdcount {
        let name = parse_name(data, &mut offset)?;
        if offset + 4 > data.len() {
            return Err(anyhow::anyhow!("DNS question section truncated"));
        }
        let qtype = RecordType::from(u16::from_be_bytes([data[offset], data[offset + 1]]));
        let qclass = DnsClass::from(u16::from_be_bytes([data[offset + 2], data[offset + 3]]));
        offset += 4;
        questions.push(DnsQuestion { name, qtype, qclass });
    }

    let answers = parse_records(data, &mut offset, ancount)?;
    let authorities = parse_records(data, &mut offset, nscount)?;
    let additionals = parse_records(data, &mut offset, arcount)?;

    Ok(DnsPacket {
        header,
        questions,
        answers,
        authorities,
        additionals,
        raw: data.to_vec(),
    })
}

fn parse_records(data: &[u8], offset: &mut usize, count: u16) -> anyhow::Result<Vec<DnsRecord>> {
    let mut records = Vec::new();
    for _ in 0..count {
        let name = parse_name(data, offset)?;
        if *offset + 10 > data.len() {
            return Err(anyhow::anyhow!("DNS record truncated at offset {}", offset));
        }
        let rtype = RecordType::from(u16::from_be_bytes([data[*offset], data[*offset + 1]]));
        let rclass = DnsClass::from(u16::from_be_bytes([data[*offset + 2], data[*offset + 3]]));
        let ttl = u32::from_be_bytes([
            data[*offset + 4],
            data[*offset + 5],
            data[*offset + 6],
            data[*offset + 7],
        ]);
        let rdlength = u16::from_be_bytes([data[*offset + 8], data[*offset + 9]]);
        *offset += 10;

        if *offset + rdlength as usize > data.len() {
            return Err(anyhow::anyhow!("DNS rdata extends beyond packet"));
        }
        let rdata_offset = *offset;
        let rdata = data[*offset..*offset + rdlength as usize].to_vec();
        *offset += rdlength as usize;

        records.push(DnsRecord {
            name,
            rtype,
            rclass,
            ttl,
            rdata,
            rdata_offset,
        });
    }
    Ok(records)
}

/// Encode a DNS name into wire format
pub fn encode_name(name: &str) -> Vec<u8> {
    let mut result = Vec::new();
    if name.is_empty() {
        result.push(0);
        return result;
    }
    for label in name.split('.') {
        result.push(label.len() as u8);
        result.extend_from_slice(label.as_bytes());
    }
    result.push(0);
    result
}

/// Build a query packet for upstream probing/forwarding
pub fn build_query(id: u16, name: &str, qtype: RecordType, rd: bool) -> Vec<u8> {
    let mut packet = Vec::with_capacity(512);

    // Header
    packet.extend_from_slice(&id.to_be_bytes());
    let flags: u16 = if rd { 0x0100 } else { 0x0000 };
    packet.extend_from_slice(&flags.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT=1
    packet.extend_from_slice(&0u16.to_be_bytes()); // ANCOUNT=0
    packet.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT=0
    packet.extend_from_slice(&0u16.to_be_bytes()); // ARCOUNT=0

    // Question
    packet.extend_from_slice(&encode_name(name));
    packet.extend_from_slice(&qtype.to_u16().to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes()); // CLASS IN

    packet
}

/// Build an NXDOMAIN response from a query packet. The server loop answers
/// with this when forwarding fails - clients handle a name error better than
/// a silent drop.
pub fn build_nxdomain(query: &[u8]) -> anyhow::Result<Vec<u8>> {
    if query.len() < 12 {
        return Err(anyhow::anyhow!("Query too short for NXDOMAIN reply"));
    }
    let mut response = query.to_vec();
    // QR=1 (response), keep opcode, TC=0, RCODE=3 (NXDOMAIN)
    response[2] = (response[2] | 0x80) & 0xFB;
    response[3] = (response[3] & 0xF0) | 0x03;
    // Zero out answer/authority/additional counts
    response[6] = 0;
    response[7] = 0;
    response[8] = 0;
    response[9] = 0;
    response[10] = 0;
    response[11] = 0;
    Ok(response)
}

/// Re-stamp an upstream answer as the reply to the original query:
/// copy the transaction ID and make sure QR/RA are set.
pub fn make_reply(query: &[u8], upstream_response: &[u8]) -> anyhow::Result<Vec<u8>> {
    if query.len() < 12 || upstream_response.len() < 12 {
        return Err(anyhow::anyhow!("Packet too short for reply"));
    }
    let mut reply = upstream_response.to_vec();
    reply[0] = query[0];
    reply[1] = query[1];
    reply[2] |= 0x80; // QR=1
    reply[3] |= 0x80; // RA=1
    Ok(reply)
}

/// Extract the query name and type from a raw DNS query
pub fn extract_query_info(data: &[u8]) -> anyhow::Result<(String, RecordType)> {
    if data.len() < 12 {
        return Err(anyhow::anyhow!("Query too short"));
    }
    let mut offset = 12;
    let name = parse_name(data, &mut offset)?;
    if offset + 4 > data.len() {
        return Err(anyhow::anyhow!("Query truncated after name"));
    }
    let qtype = RecordType::from(u16::from_be_bytes([data[offset], data[offset + 1]]));
    Ok((name, qtype))
}
