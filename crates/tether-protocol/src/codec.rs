//! The value codec: a typed registry of string encoders/decoders.
//!
//! Payload values travel as strings. [`Codec`] maps a Rust type (by
//! `TypeId`) to a pair of functions that convert it to and from that
//! string. Built-in codecs cover the engine's common value types:
//!
//! | Type | Wire name | Example |
//! |---|---|---|
//! | `i32` / `i64` | `int` / `long` | `-7` |
//! | `f32` / `f64` | `float` / `double` | `1.5` |
//! | `bool` | `bool` | `true` |
//! | `String` | `string` | `hello` |
//! | [`Vector3`] | `vector3` | `1.5,-2,0` |
//! | [`Quaternion`] | `quaternion` | `0,0,0,1` |
//! | `Vec<i32>` … `Vec<String>` | `int[]` … `string[]` | `a,b\,c,d` |
//!
//! Types without a registration fall back to structural JSON through
//! serde. The fallback never panics: an unencodable value becomes the
//! empty string and an undecodable one becomes `T::default()`.
//!
//! Decoders are total. Malformed input is logged and replaced by the
//! type's zero value (identity for quaternions); malformed array elements
//! are skipped one by one.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Serialize, de::DeserializeOwned};

use crate::escape::{join_escaped, split_escaped};
use crate::{Quaternion, Vector3};

type EncodeFn = Box<dyn Fn(&dyn Any) -> Option<String> + Send + Sync>;
type DecodeFn = Box<dyn Fn(&str) -> Box<dyn Any + Send> + Send + Sync>;

struct Registration {
    type_name: String,
    encode: EncodeFn,
    decode: DecodeFn,
}

type Registry = HashMap<TypeId, Arc<Registration>>;

/// Registry of per-type value codecs.
///
/// Shared behind an `Arc` by the components that build payloads;
/// registration takes `&self` so codecs can be added after wiring.
/// Encoders and decoders run with the registry unlocked, so they may use
/// the codec themselves.
pub struct Codec {
    registry: RwLock<Registry>,
}

impl Codec {
    /// Creates a codec with every built-in registration.
    pub fn new() -> Self {
        let codec = Self::empty();
        codec.register_builtins();
        codec
    }

    /// Creates a codec with no registrations (everything uses the
    /// structural fallback).
    pub fn empty() -> Self {
        Self {
            registry: RwLock::new(HashMap::new()),
        }
    }

    /// Registers `encode`/`decode` for `T` under `type_name`.
    ///
    /// Registering a type again replaces the previous pair.
    pub fn register<T, E, D>(&self, type_name: impl Into<String>, encode: E, decode: D)
    where
        T: Any + Send,
        E: Fn(&T) -> String + Send + Sync + 'static,
        D: Fn(&str) -> T + Send + Sync + 'static,
    {
        let type_name = type_name.into();
        let registration = Registration {
            type_name: type_name.clone(),
            encode: Box::new(move |value: &dyn Any| value.downcast_ref::<T>().map(&encode)),
            decode: Box::new(move |text: &str| Box::new(decode(text)) as Box<dyn Any + Send>),
        };

        let previous = self.write().insert(TypeId::of::<T>(), Arc::new(registration));
        match previous {
            Some(old) => tracing::debug!(
                type_name = %type_name,
                previous = %old.type_name,
                "codec replaced"
            ),
            None => tracing::trace!(type_name = %type_name, "codec registered"),
        }
    }

    /// Whether `T` has a registered codec.
    pub fn is_registered<T: Any>(&self) -> bool {
        self.read().contains_key(&TypeId::of::<T>())
    }

    /// The wire type name recorded next to encoded `T` values.
    ///
    /// Unregistered types use the Rust type name.
    pub fn type_name_of<T: Any>(&self) -> String {
        self.read()
            .get(&TypeId::of::<T>())
            .map(|r| r.type_name.clone())
            .unwrap_or_else(|| std::any::type_name::<T>().to_string())
    }

    /// Encodes `value` with its registered codec, or structurally.
    pub fn encode<T: Any + Serialize>(&self, value: &T) -> String {
        if let Some(registration) = self.lookup::<T>() {
            if let Some(text) = (registration.encode)(value as &dyn Any) {
                return text;
            }
        }
        encode_structural(value)
    }

    /// Decodes `text` as `T` with its registered codec, or structurally.
    pub fn decode<T: Any + DeserializeOwned + Default>(&self, text: &str) -> T {
        if let Some(registration) = self.lookup::<T>() {
            match (registration.decode)(text).downcast::<T>() {
                Ok(value) => return *value,
                Err(_) => tracing::warn!(
                    type_name = %registration.type_name,
                    "registered decoder produced the wrong type, using fallback"
                ),
            }
        }
        decode_structural(text)
    }

    fn lookup<T: Any>(&self) -> Option<Arc<Registration>> {
        self.read().get(&TypeId::of::<T>()).cloned()
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn register_builtins(&self) {
        self.register::<i32, _, _>("int", i32::to_string, |s| parse_scalar(s, "int"));
        self.register::<i64, _, _>("long", i64::to_string, |s| parse_scalar(s, "long"));
        self.register::<f32, _, _>("float", f32::to_string, |s| parse_scalar(s, "float"));
        self.register::<f64, _, _>("double", f64::to_string, |s| parse_scalar(s, "double"));
        self.register::<bool, _, _>("bool", bool::to_string, decode_bool);
        self.register::<String, _, _>("string", String::clone, str::to_string);
        self.register::<Vector3, _, _>("vector3", encode_vector3, decode_vector3);
        self.register::<Quaternion, _, _>("quaternion", encode_quaternion, decode_quaternion);
        self.register::<Vec<i32>, _, _>("int[]", |v| encode_array(v.as_slice()), |s| decode_number_array(s, "int"));
        self.register::<Vec<i64>, _, _>("long[]", |v| encode_array(v.as_slice()), |s| decode_number_array(s, "long"));
        self.register::<Vec<f32>, _, _>("float[]", |v| encode_array(v.as_slice()), |s| decode_number_array(s, "float"));
        self.register::<Vec<f64>, _, _>("double[]", |v| encode_array(v.as_slice()), |s| decode_number_array(s, "double"));
        self.register::<Vec<String>, _, _>("string[]", |v| encode_array(v.as_slice()), decode_string_array);
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.read();
        let mut names: Vec<&str> = registry.values().map(|r| r.type_name.as_str()).collect();
        names.sort_unstable();
        f.debug_struct("Codec").field("registered", &names).finish()
    }
}

// ---------------------------------------------------------------------------
// Structural fallback
// ---------------------------------------------------------------------------

fn encode_structural<T: Serialize>(value: &T) -> String {
    match serde_json::to_string(value) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(
                type_name = std::any::type_name::<T>(),
                error = %e,
                "structural encode failed, sending empty value"
            );
            String::new()
        }
    }
}

fn decode_structural<T: DeserializeOwned + Default>(text: &str) -> T {
    match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(
                type_name = std::any::type_name::<T>(),
                error = %e,
                "structural decode failed, using default"
            );
            T::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Built-ins
// ---------------------------------------------------------------------------

fn parse_scalar<T: FromStr + Default>(text: &str, type_name: &'static str) -> T {
    match text.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!(text, type_name, "malformed scalar, using default");
            T::default()
        }
    }
}

fn decode_bool(text: &str) -> bool {
    let text = text.trim();
    if text.eq_ignore_ascii_case("true") || text == "1" {
        true
    } else if text.eq_ignore_ascii_case("false") || text == "0" {
        false
    } else {
        tracing::warn!(text, "malformed bool, using false");
        false
    }
}

/// Parses exactly `N` comma-separated floats, or nothing at all.
fn parse_components<const N: usize>(text: &str) -> Option<[f32; N]> {
    let fields: Vec<&str> = text.split(',').collect();
    if fields.len() != N {
        return None;
    }
    let mut out = [0.0; N];
    for (slot, field) in out.iter_mut().zip(fields) {
        *slot = field.trim().parse().ok()?;
    }
    Some(out)
}

fn encode_vector3(v: &Vector3) -> String {
    format!("{},{},{}", v.x, v.y, v.z)
}

fn decode_vector3(text: &str) -> Vector3 {
    match parse_components::<3>(text) {
        Some([x, y, z]) => Vector3::new(x, y, z),
        None => {
            tracing::warn!(text, "malformed vector3, using zero");
            Vector3::ZERO
        }
    }
}

fn encode_quaternion(q: &Quaternion) -> String {
    format!("{},{},{},{}", q.x, q.y, q.z, q.w)
}

fn decode_quaternion(text: &str) -> Quaternion {
    match parse_components::<4>(text) {
        Some([x, y, z, w]) => Quaternion::new(x, y, z, w),
        None => {
            tracing::warn!(text, "malformed quaternion, using identity");
            Quaternion::IDENTITY
        }
    }
}

fn encode_array<T: ToString>(values: &[T]) -> String {
    join_escaped(values.iter().map(ToString::to_string), ',')
}

fn decode_number_array<T: FromStr>(text: &str, type_name: &'static str) -> Vec<T> {
    if text.is_empty() {
        return Vec::new();
    }
    split_escaped(text, ',')
        .into_iter()
        .enumerate()
        .filter_map(|(index, element)| match element.trim().parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(index, %element, type_name, "skipping malformed array element");
                None
            }
        })
        .collect()
}

fn decode_string_array(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    split_escaped(text, ',')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Loadout {
        slots: u8,
        name: String,
    }

    fn assert_round_trip<T>(codec: &Codec, value: T)
    where
        T: Any + Serialize + DeserializeOwned + Default + PartialEq + fmt::Debug,
    {
        let text = codec.encode(&value);
        assert_eq!(codec.decode::<T>(&text), value, "round trip through {text:?}");
    }

    #[test]
    fn test_builtin_codecs_round_trip() {
        let codec = Codec::new();

        assert_round_trip(&codec, -7i32);
        assert_round_trip(&codec, i32::MAX);
        assert_round_trip(&codec, i64::MIN);
        assert_round_trip(&codec, 9_007_199_254_740_993i64);
        assert_round_trip(&codec, -0.125f32);
        assert_round_trip(&codec, 0.3f32);
        assert_round_trip(&codec, -1234.5678f64);
        assert_round_trip(&codec, 1e-10f64);
        assert_round_trip(&codec, true);
        assert_round_trip(&codec, false);
        assert_round_trip(&codec, "key:value; with\\ escapes".to_string());
        assert_round_trip(&codec, String::new());
        assert_round_trip(&codec, Vector3::new(0.1, -2.5, 1e6));
        assert_round_trip(&codec, Quaternion::new(0.0, 0.6, 0.0, 0.8));
        assert_round_trip(&codec, vec![3i32, -1, 0]);
        assert_round_trip(&codec, vec![i64::MAX, -42]);
        assert_round_trip(&codec, vec![1.5f32, -0.25, 100.0]);
        assert_round_trip(&codec, vec![-0.001f64, 2.5e12]);
        assert_round_trip(&codec, vec!["a,b".to_string(), "c\\".to_string()]);
    }

    #[test]
    fn test_empty_arrays_encode_to_empty_string() {
        let codec = Codec::new();

        assert_eq!(codec.encode(&Vec::<i32>::new()), "");
        assert_eq!(codec.encode(&Vec::<f64>::new()), "");
        assert_round_trip(&codec, Vec::<i32>::new());
        assert_round_trip(&codec, Vec::<i64>::new());
        assert_round_trip(&codec, Vec::<f32>::new());
        assert_round_trip(&codec, Vec::<f64>::new());
        assert_round_trip(&codec, Vec::<String>::new());
    }

    #[test]
    fn test_custom_codec_may_use_codec_while_running() {
        let codec = Arc::new(Codec::new());
        let inner = Arc::clone(&codec);
        codec.register::<Loadout, _, _>(
            "loadout",
            move |v| {
                // Registering from inside an encoder needs the write lock.
                inner.register::<u8, _, _>("byte", u8::to_string, |s| parse_scalar(s, "byte"));
                format!("{}|{}", inner.encode(&v.slots), inner.encode(&v.name))
            },
            |s| {
                let (slots, name) = s.split_once('|').unwrap_or_default();
                Loadout {
                    slots: slots.parse().unwrap_or_default(),
                    name: name.to_string(),
                }
            },
        );
        let loadout = Loadout {
            slots: 2,
            name: "medic".into(),
        };

        let text = codec.encode(&loadout);

        assert_eq!(text, "2|medic");
        assert!(codec.is_registered::<u8>());
        assert_eq!(codec.decode::<Loadout>(&text), loadout);
    }

    #[test]
    fn test_encode_vector3_matches_wire_example() {
        let codec = Codec::new();
        assert_eq!(codec.encode(&Vector3::new(1.5, -2.0, 0.0)), "1.5,-2,0");
    }

    #[test]
    fn test_decode_vector3_wrong_field_count_is_zero() {
        let codec = Codec::new();
        assert_eq!(codec.decode::<Vector3>("1,2"), Vector3::ZERO);
        assert_eq!(codec.decode::<Vector3>("1,2,3,4"), Vector3::ZERO);
        assert_eq!(codec.decode::<Vector3>(""), Vector3::ZERO);
    }

    #[test]
    fn test_decode_quaternion_non_numeric_is_identity() {
        let codec = Codec::new();
        assert_eq!(codec.decode::<Quaternion>("0,0,x,1"), Quaternion::IDENTITY);
    }

    #[test]
    fn test_decode_int_array_skips_malformed_elements() {
        let codec = Codec::new();
        assert_eq!(codec.decode::<Vec<i32>>("1,oops,3,,4"), vec![1, 3, 4]);
    }

    #[test]
    fn test_string_array_matches_wire_example() {
        let codec = Codec::new();
        let values = vec!["a".to_string(), "b,c".to_string(), "d".to_string()];

        let text = codec.encode(&values);

        assert_eq!(text, "a,b\\,c,d");
        assert_eq!(codec.decode::<Vec<String>>(&text), values);
    }

    #[test]
    fn test_decode_malformed_scalars_use_defaults() {
        let codec = Codec::new();
        assert_eq!(codec.decode::<i32>("twelve"), 0);
        assert_eq!(codec.decode::<f32>(""), 0.0);
        assert!(!codec.decode::<bool>("maybe"));
    }

    #[test]
    fn test_decode_bool_accepts_numeric_forms() {
        let codec = Codec::new();
        assert!(codec.decode::<bool>("1"));
        assert!(codec.decode::<bool>("TRUE"));
        assert!(!codec.decode::<bool>("0"));
    }

    #[test]
    fn test_unregistered_type_uses_structural_fallback() {
        let codec = Codec::new();
        let loadout = Loadout {
            slots: 3,
            name: "scout".into(),
        };

        let text = codec.encode(&loadout);

        assert!(!codec.is_registered::<Loadout>());
        assert_eq!(codec.decode::<Loadout>(&text), loadout);
    }

    #[test]
    fn test_structural_fallback_garbage_decodes_to_default() {
        let codec = Codec::new();
        assert_eq!(codec.decode::<Loadout>("{not json"), Loadout::default());
    }

    #[test]
    fn test_register_replaces_existing_codec() {
        let codec = Codec::new();
        codec.register::<i32, _, _>("hex", |v| format!("{v:x}"), |s| {
            i32::from_str_radix(s, 16).unwrap_or_default()
        });

        assert_eq!(codec.encode(&255i32), "ff");
        assert_eq!(codec.decode::<i32>("ff"), 255);
        assert_eq!(codec.type_name_of::<i32>(), "hex");
    }

    #[test]
    fn test_empty_codec_falls_back_for_builtins() {
        let codec = Codec::empty();
        // Without the string codec a String goes through JSON.
        assert_eq!(codec.encode(&"hi".to_string()), "\"hi\"");
        assert_eq!(codec.decode::<String>("\"hi\""), "hi");
    }

    #[test]
    fn test_type_name_of_unregistered_is_rust_name() {
        let codec = Codec::new();
        assert!(codec.type_name_of::<Loadout>().ends_with("Loadout"));
        assert_eq!(codec.type_name_of::<Vector3>(), "vector3");
    }
}
