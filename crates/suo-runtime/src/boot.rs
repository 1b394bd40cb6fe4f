//! The bootstrap runtime: a [`Heap`] plus the handful of well-known records
//! every other component leans on, and the rooted constructors the
//! bootstrap interpreter is written against.
//!
//! The well-known values (the self-descriptive `record-type` descriptor,
//! the `string`/`symbol`/`function`/`closure` types, the symbol table and
//! the dot token) live in permanent root slots, so they survive and follow
//! every collection.

use crate::heap::{Heap, Root};
use crate::value::Value;

/// Buckets in the symbol-intern table.
const SYMBOL_BUCKETS: usize = 511;

pub struct Runtime {
    pub heap: Heap,
    record_type: Root,
    string_type: Root,
    symbol_type: Root,
    function_type: Root,
    closure_type: Root,
    symbols: Root,
    dot_token: Root,
    quote_symbol: Root,
}

impl Runtime {
    pub fn new(space_words: usize) -> Runtime {
        let mut heap = Heap::new(space_words);

        let record_type = heap.push_root(Value::NIL);
        let string_type = heap.push_root(Value::NIL);
        let symbol_type = heap.push_root(Value::NIL);
        let function_type = heap.push_root(Value::NIL);
        let closure_type = heap.push_root(Value::NIL);
        let symbols = heap.push_root(Value::NIL);
        let dot_token = heap.push_root(Value::NIL);
        let quote_symbol = heap.push_root(Value::NIL);

        let mut rt = Runtime {
            heap,
            record_type,
            string_type,
            symbol_type,
            function_type,
            closure_type,
            symbols,
            dot_token,
            quote_symbol,
        };
        rt.boot_init();
        rt
    }

    fn boot_init(&mut self) {
        // The root descriptor describes itself: reserve the record, install
        // the header pointing at its own address, then fill the fields.
        let t = self.heap.rec_alloc(2);
        self.heap.rec_set_desc(t, t);
        self.heap.rec_set(t, 0, Value::fixnum(2));
        self.heap.rec_set(t, 1, Value::NIL);
        self.heap.set_root(self.record_type, t);

        let rt_type = self.record_type_type();
        let s = self.rec_make(rt_type, &[Value::fixnum(1), Value::NIL]);
        self.heap.set_root(self.string_type, s);

        let rt_type = self.record_type_type();
        let s = self.rec_make(rt_type, &[Value::fixnum(1), Value::NIL]);
        self.heap.set_root(self.symbol_type, s);

        let rt_type = self.record_type_type();
        let s = self.rec_make(rt_type, &[Value::fixnum(2), Value::NIL]);
        self.heap.set_root(self.function_type, s);

        let rt_type = self.record_type_type();
        let s = self.rec_make(rt_type, &[Value::fixnum(2), Value::NIL]);
        self.heap.set_root(self.closure_type, s);

        let v = self.vec_make(SYMBOL_BUCKETS, Value::NIL);
        self.heap.set_root(self.symbols, v);

        let s = self.string_make(b"{dot token}");
        self.heap.set_root(self.dot_token, s);

        for (name, root) in [
            ("record-type", self.record_type),
            ("string", self.string_type),
            ("symbol", self.symbol_type),
            ("function", self.function_type),
            ("closure", self.closure_type),
        ] {
            let sym = self.intern(name);
            let t = self.heap.root(root);
            self.heap.rec_set(t, 1, sym);
        }

        let sym = self.intern("quote");
        self.heap.set_root(self.quote_symbol, sym);
    }

    // The well-known values.

    pub fn record_type_type(&self) -> Value {
        self.heap.root(self.record_type)
    }

    pub fn string_type(&self) -> Value {
        self.heap.root(self.string_type)
    }

    pub fn symbol_type(&self) -> Value {
        self.heap.root(self.symbol_type)
    }

    pub fn function_type(&self) -> Value {
        self.heap.root(self.function_type)
    }

    pub fn closure_type(&self) -> Value {
        self.heap.root(self.closure_type)
    }

    pub fn dot_token(&self) -> Value {
        self.heap.root(self.dot_token)
    }

    pub fn quote_symbol(&self) -> Value {
        self.heap.root(self.quote_symbol)
    }

    // Rooted constructors. Arguments are registered with the collector for
    // the duration of the allocation, so callers may pass values they have
    // not rooted themselves, as long as they re-read anything else they hold
    // afterwards.

    pub fn cons(&mut self, a: Value, d: Value) -> Value {
        let m = self.heap.mark();
        let a = self.heap.push_root(a);
        let d = self.heap.push_root(d);

        let v = self.heap.pair_alloc();
        let (a, d) = (self.heap.root(a), self.heap.root(d));
        self.heap.set_car(v, a);
        self.heap.set_cdr(v, d);

        self.heap.release(m);
        v
    }

    pub fn vec_make(&mut self, len: usize, init: Value) -> Value {
        let m = self.heap.mark();
        let init = self.heap.push_root(init);

        let v = self.heap.vec_alloc(len);
        let init = self.heap.root(init);
        for i in 0..len {
            self.heap.vec_set(v, i, init);
        }

        self.heap.release(m);
        v
    }

    pub fn rec_make(&mut self, ty: Value, fields: &[Value]) -> Value {
        let n = self.heap.rec_ref(ty, 0).as_fixnum();
        debug_assert_eq!(n as usize, fields.len());

        let m = self.heap.mark();
        let ty = self.heap.push_root(ty);
        let fields: Vec<Root> = fields.iter().map(|f| self.heap.push_root(*f)).collect();

        let v = self.heap.rec_alloc(n as usize);
        let t = self.heap.root(ty);
        self.heap.rec_set_desc(v, t);
        for (i, f) in fields.iter().enumerate() {
            let f = self.heap.root(*f);
            self.heap.rec_set(v, i, f);
        }

        self.heap.release(m);
        v
    }

    // Strings and symbols.

    pub fn string_make(&mut self, bytes: &[u8]) -> Value {
        let b = self.heap.bytev_alloc(bytes.len());
        for (i, c) in bytes.iter().enumerate() {
            self.heap.bytev_set_u8(b, i, *c);
        }
        let ty = self.string_type();
        self.rec_make(ty, &[b])
    }

    pub fn is_string(&self, v: Value) -> bool {
        v.is_rec() && self.heap.rec_desc(v) == self.string_type()
    }

    pub fn is_symbol(&self, v: Value) -> bool {
        v.is_rec() && self.heap.rec_desc(v) == self.symbol_type()
    }

    pub fn is_function(&self, v: Value) -> bool {
        v.is_rec() && self.heap.rec_desc(v) == self.function_type()
    }

    pub fn is_closure(&self, v: Value) -> bool {
        v.is_rec() && self.heap.rec_desc(v) == self.closure_type()
    }

    /// The bytes of a string record.
    pub fn string_bytes(&self, v: Value) -> Vec<u8> {
        let b = self.heap.rec_ref(v, 0);
        (0..self.heap.bytev_len(b))
            .map(|i| self.heap.bytev_ref_u8(b, i))
            .collect()
    }

    pub fn string_eq(&self, v: Value, s: &str) -> bool {
        let b = self.heap.rec_ref(v, 0);
        let s = s.as_bytes();
        self.heap.bytev_len(b) == s.len()
            && s.iter()
                .enumerate()
                .all(|(i, c)| self.heap.bytev_ref_u8(b, i) == *c)
    }

    pub fn symbol_name(&self, sym: Value) -> Value {
        self.heap.rec_ref(sym, 0)
    }

    pub fn symbol_text(&self, sym: Value) -> String {
        String::from_utf8_lossy(&self.string_bytes(self.symbol_name(sym))).into_owned()
    }

    fn bucket_of(name: &[u8]) -> usize {
        let mut h: u32 = 5381;
        for c in name {
            h = h.wrapping_mul(33) ^ *c as u32;
        }
        h as usize % SYMBOL_BUCKETS
    }

    fn find_symbol(&self, name: &[u8]) -> Option<Value> {
        let table = self.heap.root(self.symbols);
        let mut bucket = self.heap.vec_ref(table, Self::bucket_of(name));
        while bucket.is_pair() {
            let sym = self.heap.car(bucket);
            let s = self.symbol_name(sym);
            if self.string_bytes(s) == name {
                return Some(sym);
            }
            bucket = self.heap.cdr(bucket);
        }
        None
    }

    /// Intern a symbol by name: symbols with the same name are the same
    /// heap object.
    pub fn intern(&mut self, name: &str) -> Value {
        self.intern_bytes(name.as_bytes())
    }

    pub fn intern_bytes(&mut self, name: &[u8]) -> Value {
        if let Some(sym) = self.find_symbol(name) {
            return sym;
        }

        let m = self.heap.mark();
        let s = self.string_make(name);
        let ty = self.symbol_type();
        let sym = self.rec_make(ty, &[s]);
        let sym_root = self.heap.push_root(sym);

        let table = self.heap.root(self.symbols);
        let i = Self::bucket_of(name);
        let bucket = self.heap.vec_ref(table, i);
        let bucket = self.cons(sym, bucket);
        let table = self.heap.root(self.symbols);
        self.heap.vec_set(table, i, bucket);

        let sym = self.heap.root(sym_root);
        self.heap.release(m);
        sym
    }

    // List helpers for host-side code.

    pub fn list_from(&mut self, items: &[Value]) -> Value {
        let m = self.heap.mark();
        let items: Vec<Root> = items.iter().map(|v| self.heap.push_root(*v)).collect();
        let mut list = Value::NIL;
        let lr = self.heap.push_root(list);
        for item in items.iter().rev() {
            let item = self.heap.root(*item);
            list = self.cons(item, self.heap.root(lr));
            self.heap.set_root(lr, list);
        }
        self.heap.release(m);
        list
    }

    /// Collect the elements of a proper list. Stops at the first non-pair
    /// tail; the caller decides whether that matters.
    pub fn list_to_vec(&self, mut v: Value) -> Vec<Value> {
        let mut out = Vec::new();
        while v.is_pair() {
            out.push(self.heap.car(v));
            v = self.heap.cdr(v);
        }
        out
    }

    /// Copy the elements of a proper list into a fresh vector.
    pub fn vec_from_list(&mut self, list: Value) -> Value {
        let m = self.heap.mark();
        let lr = self.heap.push_root(list);

        let mut n = 0;
        let mut l = list;
        while l.is_pair() {
            n += 1;
            l = self.heap.cdr(l);
        }

        let v = self.vec_make(n, Value::UNSPEC);
        let mut l = self.heap.root(lr);
        for i in 0..n {
            let x = self.heap.car(l);
            self.heap.vec_set(v, i, x);
            l = self.heap.cdr(l);
        }

        self.heap.release(m);
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> Runtime {
        Runtime::new(4096)
    }

    #[test]
    fn well_known_types_are_wired_up() {
        let rt = runtime();
        let t = rt.record_type_type();
        assert_eq!(rt.heap.rec_desc(t), t);
        assert_eq!(rt.heap.rec_ref(t, 0), Value::fixnum(2));
        assert_eq!(rt.heap.rec_ref(rt.string_type(), 0), Value::fixnum(1));
        assert_eq!(rt.heap.rec_ref(rt.function_type(), 0), Value::fixnum(2));
        assert_eq!(rt.heap.rec_ref(rt.closure_type(), 0), Value::fixnum(2));
    }

    #[test]
    fn type_names_round_trip() {
        let rt = runtime();
        let name = rt.heap.rec_ref(rt.string_type(), 1);
        assert!(rt.is_symbol(name));
        assert_eq!(rt.symbol_text(name), "string");
    }

    #[test]
    fn interning_is_by_name() {
        let mut rt = runtime();
        let a = rt.intern("hello");
        let b = rt.intern("hello");
        let c = rt.intern("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(rt.symbol_text(c), "world");
    }

    #[test]
    fn interned_symbols_survive_collection() {
        let mut rt = runtime();
        rt.heap.check_enabled = true;
        let a = rt.intern("stable");
        let r = rt.heap.push_root(a);
        rt.heap.collect_now();
        let a = rt.heap.root(r);
        let b = rt.intern("stable");
        assert_eq!(a, b);
    }

    #[test]
    fn strings_hold_their_bytes() {
        let mut rt = runtime();
        let s = rt.string_make(b"ab\x00c");
        assert!(rt.is_string(s));
        assert_eq!(rt.string_bytes(s), b"ab\x00c");
        assert!(rt.string_eq(s, "ab\0c"));
        assert!(!rt.string_eq(s, "abc"));
    }

    #[test]
    fn list_construction() {
        let mut rt = runtime();
        let items = [Value::fixnum(1), Value::fixnum(2), Value::fixnum(3)];
        let l = rt.list_from(&items);
        assert_eq!(rt.list_to_vec(l), items.to_vec());
    }

    #[test]
    fn records_compare_by_descriptor() {
        let mut rt = runtime();
        let ty = rt.function_type();
        let f = rt.rec_make(ty, &[Value::fixnum(1), Value::NIL]);
        assert!(rt.is_function(f));
        assert!(!rt.is_closure(f));
        assert_eq!(rt.heap.rec_len(f), 2);
    }
}
