use std::collections::HashMap;

/// Handle to an interned byte string. Equal strings intern to the same
/// `Atom`, so identity comparison is string equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Atom(pub u32);

/// Byte-keyed string pool. Identifiers, file names, macro names and string
/// literal payloads all go through here; the pool lives for one compilation.
#[derive(Debug, Default)]
pub struct Interner {
    map: HashMap<Box<[u8]>, Atom>,
    entries: Vec<Box<[u8]>>,
}

impl Interner {
    pub fn new() -> Self {
        Interner::default()
    }

    pub fn intern_bytes(&mut self, bytes: &[u8]) -> Atom {
        if let Some(&atom) = self.map.get(bytes) {
            return atom;
        }
        let atom = Atom(self.entries.len() as u32);
        let owned: Box<[u8]> = bytes.into();
        self.entries.push(owned.clone());
        self.map.insert(owned, atom);
        atom
    }

    pub fn intern(&mut self, s: &str) -> Atom {
        self.intern_bytes(s.as_bytes())
    }

    pub fn bytes(&self, atom: Atom) -> &[u8] {
        &self.entries[atom.0 as usize]
    }

    /// The interned bytes as UTF-8 text. Names are always valid UTF-8; string
    /// literal payloads with raw escape bytes should be read via `bytes`.
    pub fn str(&self, atom: Atom) -> &str {
        std::str::from_utf8(self.bytes(atom)).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_strings_share_an_atom() {
        let mut interner = Interner::new();
        let a = interner.intern("main");
        let b = interner.intern("main");
        let c = interner.intern("other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(interner.str(a), "main");
    }

    #[test]
    fn byte_ranges_are_preserved() {
        let mut interner = Interner::new();
        let a = interner.intern_bytes(b"a\x00b\xff");
        assert_eq!(interner.bytes(a), b"a\x00b\xff");
    }
}
