//! Hessian2 subset for the `string -> string` header map carried by Bolt
//! frames. Keys and values are encoded as hessian strings and concatenated;
//! the surrounding frame supplies the total byte length.

use trellis_common::headers::HeaderBag;

const MAX_STRING_CHARS: usize = 0xffff;

pub fn encode_map(bag: &HeaderBag) -> Vec<u8> {
    let mut out = Vec::new();
    let mut entries: Vec<(&String, &String)> = bag.iter().collect();
    // Stable output for identical maps.
    entries.sort_by(|a, b| a.0.cmp(b.0));
    for (k, v) in entries {
        encode_str(&mut out, k);
        encode_str(&mut out, v);
    }
    out
}

pub fn decode_map(mut data: &[u8]) -> Result<HeaderBag, String> {
    let mut bag = HeaderBag::new();
    while !data.is_empty() {
        let (key, rest) = decode_str(data)?;
        let (value, rest) = decode_str(rest)?;
        bag.set(&key, value);
        data = rest;
    }
    Ok(bag)
}

fn encode_str(out: &mut Vec<u8>, s: &str) {
    let chars = s.chars().count();
    debug_assert!(chars <= MAX_STRING_CHARS);
    if chars < 32 {
        out.push(chars as u8);
    } else if chars < 1024 {
        out.push(0x30 + (chars >> 8) as u8);
        out.push((chars & 0xff) as u8);
    } else {
        out.push(b'S');
        out.push((chars >> 8) as u8);
        out.push((chars & 0xff) as u8);
    }
    out.extend_from_slice(s.as_bytes());
}

fn decode_str(data: &[u8]) -> Result<(String, &[u8]), String> {
    let (chars, mut rest) = match data.first() {
        None => return Err("truncated string tag".to_owned()),
        Some(&tag) if tag < 0x20 => (tag as usize, &data[1..]),
        Some(&tag) if (0x30..=0x33).contains(&tag) => {
            if data.len() < 2 {
                return Err("truncated string length".to_owned());
            }
            ((((tag - 0x30) as usize) << 8) | data[1] as usize, &data[2..])
        }
        Some(&b'S') => {
            if data.len() < 3 {
                return Err("truncated string length".to_owned());
            }
            (((data[1] as usize) << 8) | data[2] as usize, &data[3..])
        }
        Some(&tag) => return Err(format!("unsupported hessian tag {:#04x}", tag)),
    };

    let mut s = String::new();
    for _ in 0..chars {
        let (c, n) = read_utf8_char(rest)?;
        s.push(c);
        rest = &rest[n..];
    }
    Ok((s, rest))
}

fn read_utf8_char(data: &[u8]) -> Result<(char, usize), String> {
    let first = *data.first().ok_or_else(|| "truncated utf-8".to_owned())?;
    let len = match first {
        0x00..=0x7f => 1,
        0xc0..=0xdf => 2,
        0xe0..=0xef => 3,
        0xf0..=0xf7 => 4,
        _ => return Err("invalid utf-8 lead byte".to_owned()),
    };
    if data.len() < len {
        return Err("truncated utf-8".to_owned());
    }
    let s = std::str::from_utf8(&data[..len]).map_err(|e| e.to_string())?;
    let c = s.chars().next().ok_or_else(|| "empty utf-8 char".to_owned())?;
    Ok((c, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_map() {
        let mut bag = HeaderBag::new();
        bag.set("service", "testSofa");
        bag.set("rpc_trace_id", "demo");
        let encoded = encode_map(&bag);
        let decoded = decode_map(&encoded).unwrap();
        assert_eq!(decoded, bag);
    }

    #[test]
    fn long_values_use_tagged_lengths() {
        let mut bag = HeaderBag::new();
        bag.set("k", "v".repeat(100));
        bag.set("k2", "w".repeat(2000));
        let decoded = decode_map(&encode_map(&bag)).unwrap();
        assert_eq!(decoded, bag);
    }

    #[test]
    fn multibyte_chars_count_as_one() {
        let mut bag = HeaderBag::new();
        bag.set("app", "服务网格");
        let decoded = decode_map(&encode_map(&bag)).unwrap();
        assert_eq!(decoded.get("app"), Some("服务网格"));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(decode_map(&[0xff, 0x01]).is_err());
    }
}
