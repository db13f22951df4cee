//! Bundle payloads produced by the bundling engine
//!
//! The built-in engine emits a [`BundleDocument`]: the runtime prelude, one
//! registered body per module, and the epilogue that starts the entry module.
//! Engines whose output is opaque hand back [`BundleOutput::Text`] instead.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

/// Registration name of the entry module
pub const ROOT_MODULE_NAME: &str = "__root";

/// Runtime that registers module bodies and resolves `require` inside the bundle
///
/// Unknown module names fall through to the host's own `require`, which is how
/// runtime-provided modules are satisfied once their stubs are stripped.
pub const BUNDLE_PRELUDE: &str = r#"local __bundle_require, __bundle_loaded, __bundle_register, __bundle_modules = (function(superRequire)
	local loadingPlaceholder = {[{}] = true}

	local register
	local modules = {}

	local require
	local loaded = {}

	register = function(name, body)
		if not modules[name] then
			modules[name] = body
		end
	end

	require = function(name)
		local loadedModule = loaded[name]

		if loadedModule then
			if loadedModule == loadingPlaceholder then
				return nil
			end
		else
			if not modules[name] then
				if not superRequire then
					local identifier = type(name) == 'string' and '\"' .. name .. '\"' or tostring(name)
					error('Tried to require ' .. identifier .. ', but no such module has been registered')
				else
					return superRequire(name)
				end
			end

			loaded[name] = loadingPlaceholder
			loadedModule = modules[name](require, loaded, register, modules)
			loaded[name] = loadedModule
		end

		return loadedModule
	end

	return require, loaded, register, modules
end)(require)
"#;

/// Marker that opens every registration block
pub const REGISTER_CALL: &str = "__bundle_register(";

/// Marker that opens the epilogue
pub const ROOT_REQUIRE_CALL: &str = "return __bundle_require(";

/// Bundle payload as reported by a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum BundleOutput {
    Structured(BundleDocument),
    Text { text: String },
}

impl BundleOutput {
    /// The bundle as Lua source
    pub fn render(&self) -> String {
        match self {
            Self::Structured(document) => document.render(),
            Self::Text { text } => text.clone(),
        }
    }
}

/// A module body registered under its `require` name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredModule {
    pub name: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleDocument {
    pub prelude: String,
    /// Modules in registration order; the entry module comes first
    pub modules: Vec<RegisteredModule>,
    pub epilogue: String,
}

impl BundleDocument {
    /// An empty document with the standard prelude and epilogue
    pub fn new() -> Self {
        Self {
            prelude: BUNDLE_PRELUDE.to_owned(),
            modules: Vec::new(),
            epilogue: format!("{ROOT_REQUIRE_CALL}{})\n", lua_string(ROOT_MODULE_NAME)),
        }
    }

    pub fn push(&mut self, name: impl Into<String>, body: impl Into<String>) {
        self.modules.push(RegisteredModule {
            name: name.into(),
            body: body.into(),
        });
    }

    pub fn module(&self, name: &str) -> Option<&RegisteredModule> {
        self.modules.iter().find(|module| module.name == name)
    }

    /// Remove a module by name; returns whether it was present
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.modules.len();
        self.modules.retain(|module| module.name != name);
        self.modules.len() != before
    }

    pub fn render(&self) -> String {
        let mut out = String::with_capacity(
            self.prelude.len()
                + self.epilogue.len()
                + self
                    .modules
                    .iter()
                    .map(|module| module.body.len() + module.name.len() + 96)
                    .sum::<usize>(),
        );
        out.push_str(&self.prelude);
        for module in &self.modules {
            render_registration(&mut out, &module.name, &module.body);
        }
        out.push_str(&self.epilogue);
        out
    }
}

impl Default for BundleDocument {
    fn default() -> Self {
        Self::new()
    }
}

fn render_registration(out: &mut String, name: &str, body: &str) {
    let _ = writeln!(
        out,
        "{REGISTER_CALL}{}, function(require, _LOADED, __bundle_register, __bundle_modules)",
        lua_string(name)
    );
    out.push_str(body);
    if !body.is_empty() && !body.ends_with('\n') {
        out.push('\n');
    }
    out.push_str("end)\n");
}

/// Double-quoted Lua string literal for a module name
pub fn lua_string(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for ch in value.chars() {
        match ch {
            '"' | '\\' => {
                quoted.push('\\');
                quoted.push(ch);
            }
            '\n' => quoted.push_str("\\n"),
            _ => quoted.push(ch),
        }
    }
    quoted.push('"');
    quoted
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;
    use pretty_assertions::assert_eq;

    use super::*;

    fn sample() -> BundleDocument {
        let mut document = BundleDocument::new();
        document.push(ROOT_MODULE_NAME, "local button = require(\"ui.button\")\nreturn button");
        document.push("ui.button", "return {}\n");
        document
    }

    #[test]
    fn test_render_registration_blocks() {
        let mut document = sample();
        document.prelude = String::from("-- prelude\n");
        assert_snapshot!(document.render(), @r#"
        -- prelude
        __bundle_register("__root", function(require, _LOADED, __bundle_register, __bundle_modules)
        local button = require("ui.button")
        return button
        end)
        __bundle_register("ui.button", function(require, _LOADED, __bundle_register, __bundle_modules)
        return {}
        end)
        return __bundle_require("__root")
        "#);
    }

    #[test]
    fn test_remove_module() {
        let mut document = sample();
        assert!(document.remove("ui.button"));
        assert!(!document.remove("ui.button"));
        assert!(document.module("ui.button").is_none());
        assert!(document.module(ROOT_MODULE_NAME).is_some());
    }

    #[test]
    fn test_lua_string_escapes() {
        assert_eq!(lua_string("a.b"), r#""a.b""#);
        assert_eq!(lua_string(r#"we"ird\"#), r#""we\"ird\\""#);
    }

    #[test]
    fn test_serialized_format_is_tagged() -> serde_json::Result<()> {
        let output = BundleOutput::Text {
            text: "return 1".to_owned(),
        };
        assert_eq!(
            serde_json::to_string(&output)?,
            r#"{"format":"text","text":"return 1"}"#
        );

        let structured: BundleOutput = serde_json::from_str(
            r#"{"format":"structured","prelude":"","modules":[{"name":"__root","body":"return 1"}],"epilogue":""}"#,
        )?;
        assert!(matches!(structured, BundleOutput::Structured(doc) if doc.modules.len() == 1));
        Ok(())
    }
}
