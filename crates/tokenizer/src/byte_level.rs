//! Reversible byte <-> printable-char mapping used by GPT-2 style byte-level
//! BPE vocabularies (GPT-2, Qwen2, ...). Each of the 256 byte values maps to a
//! single visible code point so merges never have to deal with raw
//! whitespace or control bytes: a leading space becomes `Ġ`, newline `Ċ`.

use std::collections::HashMap;
use std::sync::OnceLock;

fn tables() -> &'static ([char; 256], HashMap<char, u8>) {
    static TABLES: OnceLock<([char; 256], HashMap<char, u8>)> = OnceLock::new();
    TABLES.get_or_init(|| {
        let printable = |b: u32| (0x21..=0x7E).contains(&b) || (0xA1..=0xAC).contains(&b) || (0xAE..=0xFF).contains(&b);

        let mut encode = ['\0'; 256];
        let mut decode = HashMap::with_capacity(256);
        let mut shifted = 0u32;
        for b in 0u32..256 {
            let code = if printable(b) {
                b
            } else {
                shifted += 1;
                255 + shifted
            };
            let c = char::from_u32(code).unwrap_or('\u{FFFD}');
            encode[b as usize] = c;
            decode.insert(c, b as u8);
        }
        (encode, decode)
    })
}

/// Maps the UTF-8 bytes of `text` to their printable stand-ins.
pub fn encode(text: &str) -> String {
    let (table, _) = tables();
    text.bytes().map(|b| table[b as usize]).collect()
}

pub fn encode_byte(byte: u8) -> char {
    tables().0[byte as usize]
}

/// Inverse of [`encode`]; unknown chars are dropped, invalid UTF-8 is replaced.
pub fn decode(symbols: &str) -> String {
    let (_, table) = tables();
    let bytes: Vec<u8> = symbols.chars().filter_map(|c| table.get(&c).copied()).collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn space_and_newline_use_gpt2_symbols() {
        assert_eq!(encode(" a"), "Ġa");
        assert_eq!(encode("\n"), "Ċ");
        assert_eq!(encode("A"), "A");
    }

    #[test]
    fn multibyte_text_survives() {
        let text = "Voilà - welcome 🚀";
        assert_eq!(decode(&encode(text)), text);
    }
}
