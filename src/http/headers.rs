//! Case-insensitive header table that preserves the first-written case.
//!
//! Writes through any case alias update the same slot; the field name used
//! on first assignment is the one serialized. Repeated fields during
//! response parsing accumulate into a value list in arrival order.

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    One(String),
    Many(Vec<String>),
}

impl Value {
    /// The first (or only) value.
    pub fn first(&self) -> &str {
        match self {
            Value::One(v) => v,
            Value::Many(list) => list.first().map(String::as_str).unwrap_or(""),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        match self {
            Value::One(v) => std::slice::from_ref(v).iter().map(String::as_str),
            Value::Many(list) => list.as_slice().iter().map(String::as_str),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HeaderTable {
    /// normalized name -> slot index
    index: HashMap<String, usize>,
    /// (original-case name, value) in insertion order
    slots: Vec<(String, Value)>,
}

impl HeaderTable {
    pub fn new() -> Self {
        HeaderTable::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(&normalize(name))
    }

    /// First value under `name`, any case.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.index
            .get(&normalize(name))
            .map(|&i| self.slots[i].1.first())
    }

    pub fn get_value(&self, name: &str) -> Option<&Value> {
        self.index.get(&normalize(name)).map(|&i| &self.slots[i].1)
    }

    /// Replace the value under `name`. The original case of the first
    /// assignment (and its position) are kept.
    pub fn set<N: Into<String>, V: Into<String>>(&mut self, name: N, value: V) {
        let name = name.into();
        let normalized = normalize(&name);
        match self.index.get(&normalized) {
            Some(&i) => self.slots[i].1 = Value::One(value.into()),
            None => {
                self.index.insert(normalized, self.slots.len());
                self.slots.push((name, Value::One(value.into())));
            }
        }
    }

    /// Add a value under `name`, promoting to a list on repeat.
    pub fn append<N: Into<String>, V: Into<String>>(&mut self, name: N, value: V) {
        let name = name.into();
        let normalized = normalize(&name);
        match self.index.get(&normalized) {
            Some(&i) => {
                let slot = &mut self.slots[i].1;
                match slot {
                    Value::One(existing) => {
                        *slot = Value::Many(vec![std::mem::take(existing), value.into()]);
                    }
                    Value::Many(list) => list.push(value.into()),
                }
            }
            None => {
                self.index.insert(normalized, self.slots.len());
                self.slots.push((name, Value::One(value.into())));
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let normalized = normalize(name);
        let i = self.index.remove(&normalized)?;
        let (_, value) = self.slots.remove(i);
        for slot in self.index.values_mut() {
            if *slot > i {
                *slot -= 1;
            }
        }
        Some(value)
    }

    /// `(original_case, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.slots.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Copy fields from `fallback` that are not present here. Used to make
    /// trailer fields visible through normal lookup without overwriting.
    pub fn merge_missing(&mut self, fallback: &HeaderTable) {
        for (name, value) in fallback.iter() {
            if !self.contains(name) {
                match value {
                    Value::One(v) => self.set(name, v.clone()),
                    Value::Many(list) => {
                        for v in list {
                            self.append(name, v.clone());
                        }
                    }
                }
            }
        }
    }

    /// Serialize as wire header lines, one per value, first-written case.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        for (name, value) in self.iter() {
            for v in value.iter() {
                out.extend_from_slice(name.as_bytes());
                out.extend_from_slice(b": ");
                out.extend_from_slice(v.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
        }
    }
}

fn normalize(name: &str) -> String {
    name.to_ascii_lowercase()
}
