//! Hides v1/v2 backend RPC shape differences behind one typed interface
//! (spec §4.4, Design Note §9 "Protocol-version branching → strategy
//! object"). `SessionController` and `BreakpointManager` reference only
//! the [`ApiDialect`] trait, never branch on version themselves.

use serde_json::{Value, json};

/// The session's bound on how much of a value the backend returns in
/// one variable-reading RPC (spec §3 "Load Config").
#[derive(Debug, Clone, Copy)]
pub struct LoadConfig {
    pub follow_pointers: bool,
    pub max_variable_recurse: i64,
    pub max_string_len: i64,
    pub max_array_values: i64,
    pub max_struct_fields: i64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            follow_pointers: false,
            max_variable_recurse: 1,
            max_string_len: 64,
            max_array_values: 64,
            max_struct_fields: -1,
        }
    }
}

impl LoadConfig {
    fn to_json(self) -> Value {
        json!({
            "followPointers": self.follow_pointers,
            "maxVariableRecurse": self.max_variable_recurse,
            "maxStringLen": self.max_string_len,
            "maxArrayValues": self.max_array_values,
            "maxStructFields": self.max_struct_fields,
        })
    }
}

/// One outbound backend RPC: the `net/rpc` method name and its argument
/// payload, already dialect-shaped.
#[derive(Debug, Clone)]
pub struct RpcCall {
    pub method: &'static str,
    pub args: Value,
}

/// Strategy object hiding v1/v2 backend dialect differences. Both
/// implementations are zero-sized; the trait object is what callers
/// hold (`Box<dyn ApiDialect>`).
pub trait ApiDialect: Send + Sync + std::fmt::Debug {
    /// The `apiVersion` value this dialect implements (1 or 2).
    fn version(&self) -> u8;

    fn set_symbol(&self, scope: Value, symbol: &str, value: &str) -> RpcCall;

    fn stacktrace(&self, goroutine_id: i64, depth: i64, full: bool) -> RpcCall;

    fn list_local_vars(&self, scope: Value, cfg: LoadConfig) -> RpcCall;

    fn list_function_args(&self, scope: Value, cfg: LoadConfig) -> RpcCall;

    fn list_package_vars(&self, filter: &str, cfg: LoadConfig) -> RpcCall;

    fn eval(&self, scope: Value, expr: &str, cfg: LoadConfig) -> RpcCall;

    fn create_breakpoint(&self, bp: Value) -> RpcCall;

    fn clear_breakpoint(&self, id: i64) -> RpcCall;

    fn list_breakpoints(&self) -> RpcCall;

    fn detach(&self, kill: bool) -> RpcCall;

    fn command(&self, name: &str) -> RpcCall;

    /// Unwraps a v2 `{State: ...}`-style envelope; identity for v1.
    fn unwrap_state<'a>(&self, response: &'a Value) -> &'a Value;
    fn unwrap_variables<'a>(&self, response: &'a Value) -> &'a Value;
    fn unwrap_locations<'a>(&self, response: &'a Value) -> &'a Value;
    fn unwrap_variable<'a>(&self, response: &'a Value) -> &'a Value;
    fn unwrap_breakpoint<'a>(&self, response: &'a Value) -> &'a Value;
    fn unwrap_breakpoints<'a>(&self, response: &'a Value) -> &'a Value;
}

/// Dialect for backend `apiVersion=1`: RPC results are the raw object,
/// no envelope.
#[derive(Debug, Clone, Copy)]
pub struct V1;

impl ApiDialect for V1 {
    fn version(&self) -> u8 {
        1
    }

    fn set_symbol(&self, scope: Value, symbol: &str, value: &str) -> RpcCall {
        RpcCall {
            method: "SetSymbol",
            args: json!({"Scope": scope, "Symbol": symbol, "Value": value}),
        }
    }

    fn stacktrace(&self, goroutine_id: i64, depth: i64, _full: bool) -> RpcCall {
        RpcCall {
            method: "StacktraceGoroutine",
            args: json!({"Id": goroutine_id, "Depth": depth}),
        }
    }

    fn list_local_vars(&self, scope: Value, _cfg: LoadConfig) -> RpcCall {
        RpcCall {
            method: "ListLocalVars",
            args: json!({"Scope": scope}),
        }
    }

    fn list_function_args(&self, scope: Value, _cfg: LoadConfig) -> RpcCall {
        RpcCall {
            method: "ListFunctionArgs",
            args: json!({"Scope": scope}),
        }
    }

    fn list_package_vars(&self, filter: &str, _cfg: LoadConfig) -> RpcCall {
        RpcCall {
            method: "ListPackageVars",
            args: json!({"Filter": filter}),
        }
    }

    fn eval(&self, scope: Value, expr: &str, _cfg: LoadConfig) -> RpcCall {
        RpcCall {
            method: "EvalSymbol",
            args: json!({"Scope": scope, "Symbol": expr}),
        }
    }

    fn create_breakpoint(&self, bp: Value) -> RpcCall {
        RpcCall {
            method: "CreateBreakpoint",
            args: json!({"Breakpoint": bp}),
        }
    }

    fn clear_breakpoint(&self, id: i64) -> RpcCall {
        RpcCall {
            method: "ClearBreakpoint",
            args: json!({"Id": id}),
        }
    }

    fn list_breakpoints(&self) -> RpcCall {
        RpcCall {
            method: "ListBreakpoints",
            args: json!({}),
        }
    }

    fn detach(&self, kill: bool) -> RpcCall {
        RpcCall {
            method: "Detach",
            args: json!(kill),
        }
    }

    fn command(&self, name: &str) -> RpcCall {
        RpcCall {
            method: "Command",
            args: json!({"Name": name}),
        }
    }

    fn unwrap_state<'a>(&self, response: &'a Value) -> &'a Value {
        response
    }
    fn unwrap_variables<'a>(&self, response: &'a Value) -> &'a Value {
        response
    }
    fn unwrap_locations<'a>(&self, response: &'a Value) -> &'a Value {
        response
    }
    fn unwrap_variable<'a>(&self, response: &'a Value) -> &'a Value {
        response
    }
    fn unwrap_breakpoint<'a>(&self, response: &'a Value) -> &'a Value {
        response
    }
    fn unwrap_breakpoints<'a>(&self, response: &'a Value) -> &'a Value {
        response
    }
}

/// Dialect for backend `apiVersion=2`: results are wrapped (`{State:
/// ...}`, `{Variables: ...}`, ...) and variable-reading RPCs always
/// carry the session load config.
#[derive(Debug, Clone, Copy)]
pub struct V2;

fn unwrap_field<'a>(response: &'a Value, field: &str) -> &'a Value {
    response.get(field).unwrap_or(response)
}

impl ApiDialect for V2 {
    fn version(&self) -> u8 {
        2
    }

    fn set_symbol(&self, scope: Value, symbol: &str, value: &str) -> RpcCall {
        RpcCall {
            method: "Set",
            args: json!({"Scope": scope, "Symbol": symbol, "Value": value}),
        }
    }

    fn stacktrace(&self, goroutine_id: i64, depth: i64, full: bool) -> RpcCall {
        RpcCall {
            method: "Stacktrace",
            args: json!({"Id": goroutine_id, "Depth": depth, "Full": full}),
        }
    }

    fn list_local_vars(&self, scope: Value, cfg: LoadConfig) -> RpcCall {
        RpcCall {
            method: "ListLocalVars",
            args: json!({"Scope": scope, "Cfg": cfg.to_json()}),
        }
    }

    fn list_function_args(&self, scope: Value, cfg: LoadConfig) -> RpcCall {
        RpcCall {
            method: "ListFunctionArgs",
            args: json!({"Scope": scope, "Cfg": cfg.to_json()}),
        }
    }

    fn list_package_vars(&self, filter: &str, cfg: LoadConfig) -> RpcCall {
        RpcCall {
            method: "ListPackageVars",
            args: json!({"Filter": filter, "Cfg": cfg.to_json()}),
        }
    }

    fn eval(&self, scope: Value, expr: &str, cfg: LoadConfig) -> RpcCall {
        RpcCall {
            method: "Eval",
            args: json!({"Scope": scope, "Expr": expr, "Cfg": cfg.to_json()}),
        }
    }

    fn create_breakpoint(&self, bp: Value) -> RpcCall {
        RpcCall {
            method: "CreateBreakpoint",
            args: json!({"Breakpoint": bp}),
        }
    }

    fn clear_breakpoint(&self, id: i64) -> RpcCall {
        RpcCall {
            method: "ClearBreakpoint",
            args: json!({"Id": id}),
        }
    }

    fn list_breakpoints(&self) -> RpcCall {
        RpcCall {
            method: "ListBreakpoints",
            args: json!({}),
        }
    }

    fn detach(&self, kill: bool) -> RpcCall {
        RpcCall {
            method: "Detach",
            args: json!({"Kill": kill}),
        }
    }

    fn command(&self, name: &str) -> RpcCall {
        RpcCall {
            method: "Command",
            args: json!({"Name": name}),
        }
    }

    fn unwrap_state<'a>(&self, response: &'a Value) -> &'a Value {
        unwrap_field(response, "State")
    }
    fn unwrap_variables<'a>(&self, response: &'a Value) -> &'a Value {
        unwrap_field(response, "Variables")
    }
    fn unwrap_locations<'a>(&self, response: &'a Value) -> &'a Value {
        unwrap_field(response, "Locations")
    }
    fn unwrap_variable<'a>(&self, response: &'a Value) -> &'a Value {
        unwrap_field(response, "Variable")
    }
    fn unwrap_breakpoint<'a>(&self, response: &'a Value) -> &'a Value {
        unwrap_field(response, "Breakpoint")
    }
    fn unwrap_breakpoints<'a>(&self, response: &'a Value) -> &'a Value {
        unwrap_field(response, "Breakpoints")
    }
}

/// Constructs the dialect for a session's negotiated `apiVersion`.
pub fn dialect_for(version: u8) -> Box<dyn ApiDialect> {
    match version {
        1 => Box::new(V1),
        _ => Box::new(V2),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v1_set_symbol_uses_set_symbol_rpc_name() {
        let call = V1.set_symbol(json!({"GoroutineID": 1}), "x", "5");
        assert_eq!(call.method, "SetSymbol");
    }

    #[test]
    fn v2_set_symbol_uses_set_rpc_name_same_payload_shape() {
        let call = V2.set_symbol(json!({"GoroutineID": 1}), "x", "5");
        assert_eq!(call.method, "Set");
        assert_eq!(call.args["Symbol"], json!("x"));
    }

    #[test]
    fn v2_variable_listing_always_carries_load_config() {
        let call = V2.list_local_vars(json!({}), LoadConfig::default());
        assert!(call.args.get("Cfg").is_some());
    }

    #[test]
    fn v1_variable_listing_has_no_load_config() {
        let call = V1.list_local_vars(json!({}), LoadConfig::default());
        assert!(call.args.get("Cfg").is_none());
    }

    #[test]
    fn v1_unwrap_is_identity() {
        let resp = json!({"Foo": "bar"});
        assert_eq!(V1.unwrap_state(&resp), &resp);
    }

    #[test]
    fn v2_unwrap_extracts_named_field() {
        let resp = json!({"State": {"exited": true}});
        assert_eq!(V2.unwrap_state(&resp), &json!({"exited": true}));
    }

    #[test]
    fn v1_detach_passes_bare_bool() {
        let call = V1.detach(true);
        assert_eq!(call.args, json!(true));
    }

    #[test]
    fn v2_detach_passes_object() {
        let call = V2.detach(true);
        assert_eq!(call.args, json!({"Kill": true}));
    }
}
