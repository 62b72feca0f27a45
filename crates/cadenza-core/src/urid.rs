//! URI <-> integer mapping.
//!
//! Buffers, events, and plugin features identify types by URI. Comparing
//! strings on the audio path is out of the question, so every URI is mapped
//! once to a compact integer (URID) and only integers travel with the data.
//!
//! The table has a static prefix of well-known URIs with fixed low ids -
//! identical in every process, so the engine and its sidecars agree on
//! those without coordination - and a dynamic suffix assigned sequentially
//! from 1000 for URIs first seen at runtime.

use std::collections::HashMap;

/// Compact identifier for a URI. 0 is never a valid URID.
pub type Urid = u32;

/// First URID of the static prefix.
const FIRST_STATIC_URID: Urid = 1;

/// First URID handed out for dynamically registered URIs.
const FIRST_DYNAMIC_URID: Urid = 1000;

/// The static prefix. Order is part of the wire contract: these ids must
/// be identical in every process that maps this table.
const STATIC_URIS: [&str; 27] = [
    "http://lv2plug.in/ns/ext/midi#MidiEvent",
    "http://lv2plug.in/ns/ext/atom#frameTime",
    "http://lv2plug.in/ns/ext/atom#Blank",
    "http://lv2plug.in/ns/ext/atom#Bool",
    "http://lv2plug.in/ns/ext/atom#Chunk",
    "http://lv2plug.in/ns/ext/atom#Double",
    "http://lv2plug.in/ns/ext/atom#Float",
    "http://lv2plug.in/ns/ext/atom#Int",
    "http://lv2plug.in/ns/ext/atom#Long",
    "http://lv2plug.in/ns/ext/atom#Literal",
    "http://lv2plug.in/ns/ext/atom#Object",
    "http://lv2plug.in/ns/ext/atom#Path",
    "http://lv2plug.in/ns/ext/atom#Property",
    "http://lv2plug.in/ns/ext/atom#Resource",
    "http://lv2plug.in/ns/ext/atom#Sequence",
    "http://lv2plug.in/ns/ext/atom#String",
    "http://lv2plug.in/ns/ext/atom#Tuple",
    "http://lv2plug.in/ns/ext/atom#URI",
    "http://lv2plug.in/ns/ext/atom#URID",
    "http://lv2plug.in/ns/ext/atom#Vector",
    "http://lv2plug.in/ns/ext/atom#Event",
    "http://lv2plug.in/ns/ext/parameters#sampleRate",
    "http://lv2plug.in/ns/ext/buf-size#minBlockLength",
    "http://lv2plug.in/ns/ext/buf-size#maxBlockLength",
    "http://lv2plug.in/ns/ext/buf-size#sequenceSize",
    "https://cadenza.audio/lv2/core#portRMS",
    "https://cadenza.audio/lv2/core#node-message",
];

/// Bidirectional URI <-> URID mapping.
pub trait UridMapper: Send {
    /// Map a URI to its URID, registering it if the mapper supports that.
    /// Returns 0 when the URI is unknown and cannot be registered.
    fn map(&mut self, uri: &str) -> Urid;

    /// Reverse lookup. Unknown ids yield `None`.
    fn unmap(&self, urid: Urid) -> Option<&str>;
}

/// The static prefix only. Unknown URIs map to 0.
#[derive(Default)]
pub struct StaticMapper;

impl StaticMapper {
    pub fn new() -> Self {
        Self
    }

    fn map_static(uri: &str) -> Urid {
        STATIC_URIS
            .iter()
            .position(|&known| known == uri)
            .map_or(0, |idx| FIRST_STATIC_URID + idx as Urid)
    }

    fn unmap_static(urid: Urid) -> Option<&'static str> {
        if urid < FIRST_STATIC_URID {
            return None;
        }
        STATIC_URIS.get((urid - FIRST_STATIC_URID) as usize).copied()
    }
}

impl UridMapper for StaticMapper {
    fn map(&mut self, uri: &str) -> Urid {
        Self::map_static(uri)
    }

    fn unmap(&self, urid: Urid) -> Option<&str> {
        Self::unmap_static(urid)
    }
}

/// Static prefix plus a dynamic suffix assigned sequentially from 1000.
pub struct DynamicMapper {
    map: HashMap<String, Urid>,
    rmap: HashMap<Urid, String>,
    next_urid: Urid,
}

impl DynamicMapper {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
            rmap: HashMap::new(),
            next_urid: FIRST_DYNAMIC_URID,
        }
    }
}

impl Default for DynamicMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl UridMapper for DynamicMapper {
    fn map(&mut self, uri: &str) -> Urid {
        let urid = StaticMapper::map_static(uri);
        if urid != 0 {
            return urid;
        }

        if let Some(&urid) = self.map.get(uri) {
            return urid;
        }
        let urid = self.next_urid;
        self.next_urid += 1;
        self.map.insert(uri.to_owned(), urid);
        self.rmap.insert(urid, uri.to_owned());
        urid
    }

    fn unmap(&self, urid: Urid) -> Option<&str> {
        StaticMapper::unmap_static(urid).or_else(|| self.rmap.get(&urid).map(String::as_str))
    }
}

/// Delegates unknown URIs to a callback - used inside plugin hosts so a
/// sidecar's table stays consistent with the engine's.
pub struct ProxyMapper {
    map_func: Box<dyn FnMut(&str) -> Urid + Send>,
    map: HashMap<String, Urid>,
    rmap: HashMap<Urid, String>,
}

impl ProxyMapper {
    pub fn new(map_func: Box<dyn FnMut(&str) -> Urid + Send>) -> Self {
        Self {
            map_func,
            map: HashMap::new(),
            rmap: HashMap::new(),
        }
    }

    /// Record a URI/URID pair resolved out of band.
    pub fn insert(&mut self, uri: &str, urid: Urid) {
        debug_assert!(!self.map.contains_key(uri));
        self.map.insert(uri.to_owned(), urid);
        self.rmap.insert(urid, uri.to_owned());
    }
}

impl UridMapper for ProxyMapper {
    fn map(&mut self, uri: &str) -> Urid {
        let urid = StaticMapper::map_static(uri);
        if urid != 0 {
            return urid;
        }
        if let Some(&urid) = self.map.get(uri) {
            return urid;
        }
        let urid = (self.map_func)(uri);
        if urid != 0 {
            self.insert(uri, urid);
        }
        urid
    }

    fn unmap(&self, urid: Urid) -> Option<&str> {
        StaticMapper::unmap_static(urid).or_else(|| self.rmap.get(&urid).map(String::as_str))
    }
}

/// URIDs the engine itself needs on the audio path, resolved once.
#[derive(Debug, Clone, Copy)]
pub struct KnownUrids {
    pub midi_event: Urid,
    pub atom_frame_time: Urid,
    pub atom_sequence: Urid,
    pub atom_chunk: Urid,
}

impl KnownUrids {
    pub fn resolve(mapper: &mut dyn UridMapper) -> Self {
        Self {
            midi_event: mapper.map("http://lv2plug.in/ns/ext/midi#MidiEvent"),
            atom_frame_time: mapper.map("http://lv2plug.in/ns/ext/atom#frameTime"),
            atom_sequence: mapper.map("http://lv2plug.in/ns/ext/atom#Sequence"),
            atom_chunk: mapper.map("http://lv2plug.in/ns/ext/atom#Chunk"),
        }
    }
}

impl Default for KnownUrids {
    fn default() -> Self {
        Self::resolve(&mut StaticMapper::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_prefix_is_stable() {
        let mut a = DynamicMapper::new();
        let mut b = DynamicMapper::new();
        for uri in STATIC_URIS {
            assert_eq!(a.map(uri), b.map(uri));
            assert!(a.map(uri) < FIRST_DYNAMIC_URID);
        }
    }

    #[test]
    fn test_dynamic_assignment_starts_at_1000() {
        let mut mapper = DynamicMapper::new();
        assert_eq!(mapper.map("urn:example:first"), 1000);
        assert_eq!(mapper.map("urn:example:second"), 1001);
        assert_eq!(mapper.map("urn:example:first"), 1000);
    }

    #[test]
    fn test_map_unmap_round_trip() {
        let mut mapper = DynamicMapper::new();
        let uris = [
            "http://lv2plug.in/ns/ext/atom#Sequence",
            "urn:example:one",
            "urn:example:two",
        ];
        for uri in uris {
            let urid = mapper.map(uri);
            assert_eq!(mapper.unmap(urid), Some(uri));
        }
    }

    #[test]
    fn test_unknown_unmap_is_none() {
        let mapper = DynamicMapper::new();
        assert_eq!(mapper.unmap(0), None);
        assert_eq!(mapper.unmap(500), None);
        assert_eq!(mapper.unmap(99_999), None);
    }

    #[test]
    fn test_static_mapper_rejects_unknown() {
        let mut mapper = StaticMapper::new();
        assert_eq!(mapper.map("urn:example:unknown"), 0);
    }

    #[test]
    fn test_proxy_delegates_and_caches() {
        let mut calls = 0u32;
        // The callback is only consulted once per URI
        let mut proxy = ProxyMapper::new(Box::new(move |_uri| {
            calls += 1;
            2000 + calls
        }));
        let urid = proxy.map("urn:example:remote");
        assert_eq!(urid, 2001);
        assert_eq!(proxy.map("urn:example:remote"), 2001);
        assert_eq!(proxy.unmap(2001), Some("urn:example:remote"));
        // Static URIs never reach the callback
        assert_eq!(
            proxy.map("http://lv2plug.in/ns/ext/midi#MidiEvent"),
            StaticMapper::map_static("http://lv2plug.in/ns/ext/midi#MidiEvent")
        );
    }

    #[test]
    fn test_known_urids() {
        let known = KnownUrids::default();
        assert_eq!(known.midi_event, 1);
        assert_eq!(known.atom_frame_time, 2);
        assert_eq!(known.atom_sequence, 15);
    }
}
