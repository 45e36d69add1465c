//! Converts backend variable trees into DAP-visible values and manages
//! the handle table for lazy expansion (spec §4.7).
//!
//! Handle tables are implemented as a generation-stamped arena (Design
//! Note §9 "Handle tables → arena with generation"), generalized from
//! the teacher's `HashMap`-keyed session table pattern (`session.rs`'s
//! `sessions: HashMap<PathBuf, TraceSession>`) to integer keys stamped
//! with a monotonic generation so stale dereferences fail loudly
//! instead of returning data from a since-reset stop.

use std::collections::HashMap;

use serde_json::Value;

use crate::errors::{InvalidHandle, StaleHandle};

// ---------------------------------------------------------------------------
// Handle arena
// ---------------------------------------------------------------------------

/// An arena of `T` keyed by opaque `i64` handles. Every [`reset`] bumps
/// the generation and drops all prior entries; a handle minted before
/// the bump is recognizably stale rather than silently wrong.
#[derive(Debug)]
pub struct HandleArena<T> {
    generation: i64,
    next_index: i64,
    entries: HashMap<i64, T>,
}

const GENERATION_SHIFT: i64 = 24;
const INDEX_MASK: i64 = (1 << GENERATION_SHIFT) - 1;

impl<T> Default for HandleArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleArena<T> {
    pub fn new() -> Self {
        Self {
            generation: 1,
            next_index: 1,
            entries: HashMap::new(),
        }
    }

    /// Stamps `value` with the current generation and returns its handle.
    pub fn insert(&mut self, value: T) -> i64 {
        let index = self.next_index;
        self.next_index += 1;
        self.entries.insert(index, value);
        (self.generation << GENERATION_SHIFT) | index
    }

    /// Resolves a handle, failing distinctly for "stale" (right shape,
    /// wrong generation) vs "never existed".
    pub fn get(&self, handle: i64) -> Result<&T, HandleLookupError> {
        let generation = handle >> GENERATION_SHIFT;
        let index = handle & INDEX_MASK;

        if generation != self.generation {
            return Err(HandleLookupError::Stale(StaleHandle(handle)));
        }
        self.entries
            .get(&index)
            .ok_or(HandleLookupError::Invalid(InvalidHandle(handle)))
    }

    /// Invalidates every outstanding handle by bumping the generation
    /// and clearing entries. Called on every re-entry to stopped state,
    /// *before* the Stopped event is sent (spec §4.8), realizing the
    /// handle-freshness invariant (Testable Property 2).
    pub fn reset(&mut self) {
        self.generation += 1;
        self.next_index = 1;
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug)]
pub enum HandleLookupError {
    Stale(StaleHandle),
    Invalid(InvalidHandle),
}

impl std::fmt::Display for HandleLookupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stale(e) => write!(f, "{e}"),
            Self::Invalid(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for HandleLookupError {}

/// A stack-frame handle resolves to (goroutine id, frame index).
#[derive(Debug, Clone, Copy)]
pub struct FrameRef {
    pub goroutine_id: i64,
    pub frame_index: i64,
}

/// A variable handle resolves to the backend node needed to re-query
/// children, plus the fully-qualified expression used for lazy
/// expansion (spec §4.7 "Fully-qualified-name propagation").
///
/// `fqn` and `eval_expr` coincide for ordinary struct/pointer fields;
/// they diverge for map values (indexed by key, not by field name) and
/// boxed slice/array elements (re-evaluated by address, not by name) —
/// see `session::render_map_children` and the boxed-element branch of
/// `render_variable_children`.
#[derive(Debug, Clone)]
pub struct VariableRef {
    pub node: Value,
    pub fqn: String,
    pub eval_expr: String,
    pub goroutine_id: i64,
    pub frame_index: i64,
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// One DAP-visible variable: the fields `variables`/`scopes` responses need.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedVariable {
    pub name: String,
    pub value: String,
    pub var_type: String,
    /// `0` means "not expandable"; otherwise a freshly-minted handle.
    pub variables_reference: i64,
}

fn get_str<'a>(v: &'a Value, key: &str) -> &'a str {
    v.get(key).and_then(Value::as_str).unwrap_or("")
}

fn get_i64(v: &Value, key: &str) -> i64 {
    v.get(key).and_then(Value::as_i64).unwrap_or(0)
}

fn get_bool(v: &Value, key: &str) -> bool {
    v.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn children_of(v: &Value) -> &[Value] {
    match v.get("children") {
        Some(Value::Array(arr)) => arr.as_slice(),
        _ => &[],
    }
}

fn has_children(v: &Value) -> bool {
    !children_of(v).is_empty()
}

/// Renders a single backend variable node's display value per the
/// reflect-kind table in spec §4.7. Does not decide expandability or
/// mint a handle — that's `VariableRenderer::render_entry`'s job, which
/// also needs the handle arena.
pub fn render_value(node: &Value) -> String {
    let kind = get_str(node, "kind");
    let declared_type = get_str(node, "type");
    let unreadable = get_str(node, "unreadable");

    if !unreadable.is_empty() && kind != "String" {
        return unreadable.to_string();
    }

    match kind {
        "UnsafePointer" => {
            let addr = get_i64(node, "address");
            format!("unsafe.Pointer(0x{addr:x})")
        }
        "Ptr" => {
            let base = get_i64(node, "base");
            if base == 0 {
                format!("nil {declared_type}")
            } else if children_of(node).is_empty() && get_str(node, "value") == "void" {
                "void".to_string()
            } else {
                format!("{declared_type}(0x{base:x})")
            }
        }
        "Slice" => {
            let base = get_i64(node, "base");
            if base == 0 {
                format!("nil {declared_type}")
            } else {
                let len = get_i64(node, "len");
                let cap = get_i64(node, "cap");
                format!("{declared_type} (length: {len}, cap: {cap})")
            }
        }
        "Map" => {
            let base = get_i64(node, "base");
            if base == 0 {
                format!("nil {declared_type}")
            } else {
                let len = get_i64(node, "len");
                format!("{declared_type} (length: {len})")
            }
        }
        "Array" => declared_type.to_string(),
        "String" => {
            let len = get_i64(node, "len");
            let value = get_str(node, "value");
            if !unreadable.is_empty() {
                return unreadable.to_string();
            }
            let byte_len = value.len() as i64;
            if byte_len < len {
                let more = len - byte_len;
                format!("\"{value}\"...+{more} more")
            } else {
                format!("\"{value}\"")
            }
        }
        _ => {
            let value = get_str(node, "value");
            if !value.is_empty() {
                value.to_string()
            } else {
                declared_type.to_string()
            }
        }
    }
}

/// Whether a rendered variable should get a `variables_reference`
/// (expandability column of the reflect-kind table).
fn is_expandable(node: &Value) -> bool {
    let kind = get_str(node, "kind");
    match kind {
        "UnsafePointer" => false,
        "Ptr" => get_i64(node, "base") != 0 && has_children(node),
        "Slice" => get_i64(node, "base") != 0,
        "Map" => get_i64(node, "base") != 0,
        "Array" => true,
        "String" => false,
        _ => has_children(node),
    }
}

/// Whether a node needs a fresh `Eval` of its fully-qualified name
/// before its children can be shown: a partially-loaded struct/array
/// (`len > children.len()`) or an interface whose first child is an
/// address-only placeholder (spec §4.7 "Lazy expansion").
pub fn needs_fresh_eval(node: &Value) -> bool {
    let len = node.get("len").and_then(Value::as_i64);
    let children = children_of(node);

    if let Some(len) = len
        && len > children.len() as i64
    {
        return true;
    }

    matches!(children.first(), Some(first) if get_bool(first, "onlyAddr"))
}

/// The expression used to re-evaluate a partially-loaded slice/array
/// element that is itself boxed (an interface/pointer the backend only
/// gave an address for): `*(*"<type>")(<addr>)`, where `addr_expr` is
/// already formatted as a hex address literal like `0x1234` (spec
/// §4.7 "For slices/arrays of boxed elements").
pub fn boxed_element_eval_expr(addr_expr: &str, declared_type: &str) -> String {
    format!("*(*\"{declared_type}\")({addr_expr})")
}

/// The expression used to load a map entry's value by its already
/// rendered key: `<map-fqn>[<rendered-key>]`, where `map_fqn` is the
/// map variable's own fully-qualified name — already `<parent>.<name>`
/// from the usual fqn-propagation rule, so no further `.<name>` segment
/// is appended here (spec §4.7 "map entries ... alternating key,value
/// pairs").
pub fn map_entry_eval_expr(map_fqn: &str, rendered_key: &str) -> String {
    format!("{map_fqn}[{rendered_key}]")
}

/// Disambiguates shadowed locals of the same name (spec §4.7): groups
/// by name, sorts each group by declared line descending, and wraps the
/// k-th member's display name in `k+1` layers of parentheses.
///
/// Input order is otherwise preserved for non-shadowed variables;
/// shadowed members are renamed in place.
pub fn disambiguate_shadows(nodes: &mut [(String, Value)]) {
    let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
    for (idx, (name, node)) in nodes.iter().enumerate() {
        if get_bool(node, "shadowed") || node_has_shadow_flag(node) {
            groups.entry(name.clone()).or_default().push(idx);
        }
    }

    for (_, mut indices) in groups {
        indices.sort_by_key(|&idx| std::cmp::Reverse(get_i64(&nodes[idx].1, "declLine")));
        for (k, idx) in indices.into_iter().enumerate() {
            let base = nodes[idx].0.clone();
            let depth = k + 1;
            let wrapped = if depth == 1 {
                base
            } else {
                format!("{}{}{}", "(".repeat(depth - 1), base, ")".repeat(depth - 1))
            };
            nodes[idx].0 = wrapped;
        }
    }
}

fn node_has_shadow_flag(node: &Value) -> bool {
    node.get("flags")
        .and_then(Value::as_array)
        .map(|flags| flags.iter().any(|f| f.as_str() == Some("shadowed")))
        .unwrap_or(false)
}

/// Owns the two handle tables (variable, stack-frame) for one session
/// and implements the expandability/rendering rules from spec §4.7.
#[derive(Debug, Default)]
pub struct VariableRenderer {
    pub frame_handles: HandleArena<FrameRef>,
    pub variable_handles: HandleArena<VariableRef>,
}

impl VariableRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets both handle tables. Must be called before the Stopped
    /// event is sent on every re-entry to stopped state (spec §4.8).
    pub fn reset_on_stop(&mut self) {
        self.frame_handles.reset();
        self.variable_handles.reset();
    }

    /// Renders one backend variable node, minting a variable handle iff
    /// it's expandable. `fqn` doubles as the expression used to
    /// re-evaluate this node's children (the common case); use
    /// [`VariableRenderer::render_entry_with_eval`] when the two must
    /// differ (map values, boxed slice/array elements).
    pub fn render_entry(
        &mut self,
        name: &str,
        node: &Value,
        fqn: &str,
        goroutine_id: i64,
        frame_index: i64,
    ) -> RenderedVariable {
        self.render_entry_with_eval(name, node, fqn, fqn, goroutine_id, frame_index)
    }

    /// Renders one backend variable node whose re-evaluation expression
    /// (`eval_expr`) is not the same as its fully-qualified display name
    /// (`fqn`) — spec §4.7's map-entry and boxed-element overrides of
    /// the general "eval by fqn" lazy-expansion rule.
    pub fn render_entry_with_eval(
        &mut self,
        name: &str,
        node: &Value,
        fqn: &str,
        eval_expr: &str,
        goroutine_id: i64,
        frame_index: i64,
    ) -> RenderedVariable {
        let expandable = is_expandable(node);
        let variables_reference = if expandable {
            self.variable_handles.insert(VariableRef {
                node: node.clone(),
                fqn: fqn.to_string(),
                eval_expr: eval_expr.to_string(),
                goroutine_id,
                frame_index,
            })
        } else {
            0
        };

        RenderedVariable {
            name: name.to_string(),
            value: render_value(node),
            var_type: get_str(node, "type").to_string(),
            variables_reference,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn arena_handles_round_trip() {
        let mut arena: HandleArena<i32> = HandleArena::new();
        let h = arena.insert(42);
        assert_eq!(*arena.get(h).unwrap(), 42);
    }

    #[test]
    fn arena_reset_invalidates_old_handles() {
        let mut arena: HandleArena<i32> = HandleArena::new();
        let h = arena.insert(42);
        arena.reset();
        assert!(matches!(arena.get(h), Err(HandleLookupError::Stale(_))));
    }

    #[test]
    fn arena_rejects_never_issued_handle() {
        let arena: HandleArena<i32> = HandleArena::new();
        assert!(matches!(arena.get(1), Err(HandleLookupError::Invalid(_))));
    }

    #[test]
    fn render_unsafe_pointer() {
        let node = json!({"kind": "UnsafePointer", "address": 255});
        assert_eq!(render_value(&node), "unsafe.Pointer(0xff)");
    }

    #[test]
    fn render_nil_pointer() {
        let node = json!({"kind": "Ptr", "base": 0, "type": "*int"});
        assert_eq!(render_value(&node), "nil *int");
    }

    #[test]
    fn render_slice_nil() {
        let node = json!({"kind": "Slice", "base": 0, "type": "[]int"});
        assert_eq!(render_value(&node), "nil []int");
    }

    #[test]
    fn render_slice_with_length_and_cap() {
        let node = json!({"kind": "Slice", "base": 1, "type": "[]int", "len": 3, "cap": 4});
        assert_eq!(render_value(&node), "[]int (length: 3, cap: 4)");
    }

    #[test]
    fn render_map_with_length() {
        let node = json!({"kind": "Map", "base": 1, "type": "map[string]int", "len": 2});
        assert_eq!(render_value(&node), "map[string]int (length: 2)");
    }

    #[test]
    fn scenario_s5_string_truncation() {
        let node = json!({"kind": "String", "value": "hello", "len": 12, "unreadable": ""});
        assert_eq!(render_value(&node), "\"hello\"...+7 more");
    }

    #[test]
    fn string_fully_read_has_no_suffix() {
        let node = json!({"kind": "String", "value": "hi", "len": 2, "unreadable": ""});
        assert_eq!(render_value(&node), "\"hi\"");
    }

    #[test]
    fn struct_shows_type_when_no_value() {
        let node = json!({"kind": "Struct", "type": "main.Foo", "value": ""});
        assert_eq!(render_value(&node), "main.Foo");
    }

    #[test]
    fn scenario_s4_shadowed_locals_naming() {
        let mut nodes = vec![
            (
                "x".to_string(),
                json!({"shadowed": true, "declLine": 20}),
            ),
            (
                "x".to_string(),
                json!({"shadowed": true, "declLine": 15}),
            ),
            (
                "x".to_string(),
                json!({"shadowed": true, "declLine": 25}),
            ),
        ];
        disambiguate_shadows(&mut nodes);

        let by_line = |line: i64| nodes.iter().find(|(_, n)| get_i64(n, "declLine") == line).unwrap().0.clone();
        assert_eq!(by_line(25), "x");
        assert_eq!(by_line(20), "(x)");
        assert_eq!(by_line(15), "((x))");
    }

    #[test]
    fn needs_fresh_eval_for_partial_struct() {
        let node = json!({"len": 5, "children": [{}]});
        assert!(needs_fresh_eval(&node));
    }

    #[test]
    fn needs_fresh_eval_for_only_addr_interface() {
        let node = json!({"children": [{"onlyAddr": true}]});
        assert!(needs_fresh_eval(&node));
    }

    #[test]
    fn fully_loaded_node_does_not_need_fresh_eval() {
        let node = json!({"len": 1, "children": [{}]});
        assert!(!needs_fresh_eval(&node));
    }

    #[test]
    fn render_entry_mints_handle_only_when_expandable() {
        let mut renderer = VariableRenderer::new();
        let expandable = json!({"kind": "Struct", "type": "T", "value": "", "children": [{"name": "f"}]});
        let not_expandable = json!({"kind": "String", "value": "hi", "len": 2, "unreadable": ""});

        let r1 = renderer.render_entry("s", &expandable, "s", 1, 0);
        let r2 = renderer.render_entry("str", &not_expandable, "str", 1, 0);

        assert_ne!(r1.variables_reference, 0);
        assert_eq!(r2.variables_reference, 0);
    }
}
