//! The Tag-Injecting Transform itself (component B): an `swc_ecma_visit`
//! `VisitMut` pass over a parsed `.jsx`/`.tsx` module.
//!
//! Built on `swc_core`'s own `VisitMut` contract. The pass is single-purpose:
//! walk every `JSXOpeningElement`, and for native (lowercase-tag) elements not
//! already tagged, attach `data-jsx-id`/`file`/`line`/`col`. Elements inside
//! an untyped loop callback (`.map`/`.forEach`/...) get a dynamic id
//! expression instead of a literal.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use swc_common::sync::Lrc;
use swc_common::{SourceMap, Span, DUMMY_SP};
use swc_ecma_ast::{
    BinExpr, BinaryOp, CallExpr, Callee, Expr, Ident, IdentName, JSXAttr, JSXAttrName,
    JSXAttrOrSpread, JSXAttrValue, JSXElementName, JSXExpr, JSXExprContainer, JSXOpeningElement,
    Lit, MemberExpr, MemberProp, Module, Param, Pat, Str,
};
use swc_ecma_codegen::text_writer::JsWriter;
use swc_ecma_codegen::{Config as CodegenConfig, Emitter};
use swc_ecma_parser::{lexer::Lexer, Parser, StringInput, Syntax, TsSyntax};
use swc_ecma_visit::{VisitMut, VisitMutWith};

use super::id::generate_stable_id;
use super::map::JsxLocation;

/// Array/iterable methods whose callback receives an index as its second
/// parameter — the loop-aware tagging rule applies inside these.
const LOOP_METHODS: &[&str] = &[
    "map", "forEach", "filter", "find", "findIndex", "some", "every", "flatMap",
];

/// Synthetic identifier inserted as a callback's second parameter when one
/// is missing.
const SYNTHETIC_INDEX_IDENT: &str = "__jsx_idx__";

/// Configuration for a single transform invocation.
#[derive(Debug, Clone, Default)]
pub struct TaggerConfig {
    pub id_prefix: Option<String>,
    pub exclude: Vec<String>,
}

/// Result of transforming one file: the rewritten source and the location
/// entries it produced (fed into `SourceMapManager::replace_file_entries`).
#[derive(Debug, Clone)]
pub struct TransformResult {
    pub code: String,
    pub entries: Vec<(String, JsxLocation)>,
}

/// True when `path` should be run through the tagger: a `.jsx`/`.tsx` file,
/// not under `node_modules`, and not matched by `exclude`.
pub fn should_process(path: &Path, exclude: &[String]) -> bool {
    let is_jsx_family = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("jsx") | Some("tsx")
    );
    if !is_jsx_family {
        return false;
    }
    let path_str = path.to_string_lossy();
    if path_str.split('/').any(|seg| seg == "node_modules") {
        return false;
    }
    !exclude.iter().any(|pattern| path_str.contains(pattern.as_str()))
}

/// Parse, tag, and re-emit `source` as if it were `file_path`.
pub fn transform_source(
    file_path: &str,
    source: &str,
    config: &TaggerConfig,
) -> Result<TransformResult> {
    let cm: Lrc<SourceMap> = Default::default();
    let fm = cm.new_source_file(
        Arc::new(swc_common::FileName::Custom(file_path.to_string())),
        source.to_string(),
    );

    let is_tsx = file_path.ends_with(".tsx");
    let syntax = if is_tsx {
        Syntax::Typescript(TsSyntax {
            tsx: true,
            ..Default::default()
        })
    } else {
        Syntax::Es(swc_ecma_parser::EsSyntax {
            jsx: true,
            ..Default::default()
        })
    };

    let lexer = Lexer::new(
        syntax,
        swc_ecma_ast::EsVersion::latest(),
        StringInput::from(&*fm),
        None,
    );
    let mut parser = Parser::new_from(lexer);
    let mut module: Module = parser
        .parse_module()
        .map_err(|e| anyhow::anyhow!("parse error in {file_path}: {e:?}"))
        .context("failed to parse source for tagging")?;

    let mut injector = TagInjector {
        cm: cm.clone(),
        file: file_path.to_string(),
        prefix: config.id_prefix.clone(),
        loop_stack: Vec::new(),
        entries: Vec::new(),
    };
    module.visit_mut_with(&mut injector);

    let code = emit(&cm, &module)?;

    Ok(TransformResult {
        code,
        entries: injector.entries,
    })
}

fn emit(cm: &Lrc<SourceMap>, module: &Module) -> Result<String> {
    let mut buf = Vec::new();
    {
        let writer = JsWriter::new(cm.clone(), "\n", &mut buf, None);
        let mut emitter = Emitter {
            cfg: CodegenConfig::default(),
            cm: cm.clone(),
            comments: None,
            wr: writer,
        };
        emitter
            .emit_module(module)
            .map_err(|e| anyhow::anyhow!("codegen failed: {e}"))?;
    }
    String::from_utf8(buf).context("emitted source was not valid UTF-8")
}

/// What an element nested inside a loop callback should do for its id.
#[derive(Debug, Clone)]
enum LoopCtx {
    /// Emit `"<base>-" + <ident>` instead of a literal.
    Dynamic(String),
    /// The callback already destructures its index param — per the Open
    /// Question resolution (DESIGN.md), fall back to a static id and accept
    /// the DOM-uniqueness caveat rather than guess intent.
    StaticFallback,
}

struct TagInjector {
    cm: Lrc<SourceMap>,
    file: String,
    prefix: Option<String>,
    loop_stack: Vec<LoopCtx>,
    entries: Vec<(String, JsxLocation)>,
}

impl TagInjector {
    fn line_col(&self, span: Span) -> (u32, u32) {
        let loc = self.cm.lookup_char_pos(span.lo);
        (loc.line as u32, loc.col.0 as u32 + 1)
    }
}

impl VisitMut for TagInjector {
    fn visit_mut_call_expr(&mut self, node: &mut CallExpr) {
        let Some(callback_idx) = loop_callback_index(node) else {
            node.visit_mut_children_with(self);
            return;
        };

        // Visit the callee (the receiver expression, e.g. `items` in
        // `items.map(cb)`) without the loop context — only the callback body
        // is "inside the loop".
        node.callee.visit_mut_with(self);

        for (i, arg) in node.args.iter_mut().enumerate() {
            if i == callback_idx {
                let ctx = prepare_callback_params(&mut arg.expr);
                self.loop_stack.push(ctx);
                arg.expr.visit_mut_with(self);
                self.loop_stack.pop();
            } else {
                arg.expr.visit_mut_with(self);
            }
        }
    }

    fn visit_mut_jsx_opening_element(&mut self, node: &mut JSXOpeningElement) {
        node.visit_mut_children_with(self);

        let Some(tag_name) = native_tag_name(&node.name) else {
            return;
        };

        let (line, column) = self.line_col(node.span);

        if let Some(existing_id) = existing_jsx_id(node) {
            // Idempotence: already tagged, re-transform only refreshes the
            // source-map entry, never the attributes.
            self.entries.push((
                existing_id,
                JsxLocation {
                    file: self.file.clone(),
                    line,
                    column,
                    element_name: tag_name,
                },
            ));
            return;
        }

        let base_id = generate_stable_id(&self.file, line, column, self.prefix.as_deref());

        match self.loop_stack.last() {
            Some(LoopCtx::Dynamic(idx_ident)) => {
                node.attrs.push(dynamic_id_attr(&base_id, idx_ident));
            }
            Some(LoopCtx::StaticFallback) => {
                tracing::warn!(
                    file = %self.file,
                    line,
                    column,
                    "loop callback already destructures its index parameter; \
                     emitting a static data-jsx-id for this call site, DOM ids \
                     across iterations will collide"
                );
                node.attrs.push(str_attr("data-jsx-id", &base_id));
            }
            None => {
                node.attrs.push(str_attr("data-jsx-id", &base_id));
            }
        }
        node.attrs.push(str_attr("data-jsx-file", &self.file));
        node.attrs.push(str_attr("data-jsx-line", &line.to_string()));
        node.attrs.push(str_attr("data-jsx-col", &column.to_string()));

        self.entries.push((
            base_id,
            JsxLocation {
                file: self.file.clone(),
                line,
                column,
                element_name: tag_name,
            },
        ));
    }
}

/// `Some(i)` if `node` is a call of the shape `X.<loopMethod>(...)` and
/// argument `i` is the callback to recurse into with loop context.
fn loop_callback_index(node: &CallExpr) -> Option<usize> {
    let Callee::Expr(callee) = &node.callee else {
        return None;
    };
    let Expr::Member(MemberExpr {
        prop: MemberProp::Ident(IdentName { sym, .. }),
        ..
    }) = &**callee
    else {
        return None;
    };
    if !LOOP_METHODS.contains(&sym.as_str()) {
        return None;
    }
    if node.args.is_empty() {
        return None;
    }
    Some(0)
}

/// Inspect (and, if needed, mutate) the callback's parameter list. Returns
/// the loop context elements inside the callback body should use.
fn prepare_callback_params(expr: &mut Expr) -> LoopCtx {
    match expr {
        Expr::Arrow(arrow) => resolve_and_patch(&mut arrow.params),
        Expr::Fn(fn_expr) => {
            let mut pats: Vec<Pat> = fn_expr
                .function
                .params
                .iter()
                .map(|p| p.pat.clone())
                .collect();
            let ctx = resolve_and_patch(&mut pats);
            fn_expr.function.params = pats
                .into_iter()
                .map(|pat| Param {
                    span: DUMMY_SP,
                    decorators: Vec::new(),
                    pat,
                })
                .collect();
            ctx
        }
        // Not a recognisable inline callback (e.g. a bare function
        // reference) — no index identifier is reachable, fall back.
        _ => LoopCtx::StaticFallback,
    }
}

fn resolve_and_patch(params: &mut Vec<Pat>) -> LoopCtx {
    match params.len() {
        0 | 1 => {
            params.push(Pat::Ident(
                Ident::new(SYNTHETIC_INDEX_IDENT.into(), DUMMY_SP, Default::default()).into(),
            ));
            LoopCtx::Dynamic(SYNTHETIC_INDEX_IDENT.to_string())
        }
        _ => match &params[1] {
            Pat::Ident(binding) => LoopCtx::Dynamic(binding.id.sym.to_string()),
            _ => LoopCtx::StaticFallback,
        },
    }
}

fn native_tag_name(name: &JSXElementName) -> Option<String> {
    let JSXElementName::Ident(ident) = name else {
        // `JSXMemberExpr` (e.g. `Foo.Bar`) and namespaced names are always
        // components in this transform's native-tag sense.
        return None;
    };
    let tag = ident.sym.to_string();
    let starts_lowercase = tag.chars().next().is_some_and(|c| c.is_ascii_lowercase());
    starts_lowercase.then_some(tag)
}

fn attr_ident_name(attr: &JSXAttrOrSpread) -> Option<&str> {
    match attr {
        JSXAttrOrSpread::JSXAttr(JSXAttr {
            name: JSXAttrName::Ident(ident),
            ..
        }) => Some(ident.sym.as_str()),
        _ => None,
    }
}

fn existing_jsx_id(node: &JSXOpeningElement) -> Option<String> {
    node.attrs.iter().find_map(|attr| {
        if attr_ident_name(attr)? != "data-jsx-id" {
            return None;
        }
        let JSXAttrOrSpread::JSXAttr(JSXAttr {
            value: Some(JSXAttrValue::Lit(Lit::Str(s))),
            ..
        }) = attr
        else {
            return None;
        };
        Some(s.value.to_string())
    })
}

fn str_attr(name: &str, value: &str) -> JSXAttrOrSpread {
    JSXAttrOrSpread::JSXAttr(JSXAttr {
        span: DUMMY_SP,
        name: JSXAttrName::Ident(IdentName::new(name.into(), DUMMY_SP)),
        value: Some(JSXAttrValue::Lit(Lit::Str(Str {
            span: DUMMY_SP,
            value: value.into(),
            raw: None,
        }))),
    })
}

/// `data-jsx-id={"<base>-" + <idx_ident>}`
fn dynamic_id_attr(base_id: &str, idx_ident: &str) -> JSXAttrOrSpread {
    let expr = Expr::Bin(BinExpr {
        span: DUMMY_SP,
        op: BinaryOp::Add,
        left: Box::new(Expr::Lit(Lit::Str(Str {
            span: DUMMY_SP,
            value: format!("{base_id}-").into(),
            raw: None,
        }))),
        right: Box::new(Expr::Ident(Ident::new(
            idx_ident.into(),
            DUMMY_SP,
            Default::default(),
        ))),
    });

    JSXAttrOrSpread::JSXAttr(JSXAttr {
        span: DUMMY_SP,
        name: JSXAttrName::Ident(IdentName::new("data-jsx-id".into(), DUMMY_SP)),
        value: Some(JSXAttrValue::JSXExprContainer(JSXExprContainer {
            span: DUMMY_SP,
            expr: JSXExpr::Expr(Box::new(expr)),
        })),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn has_attr(code: &str, name: &str) -> bool {
        code.contains(name)
    }

    #[test]
    fn should_process_accepts_tsx_outside_node_modules() {
        assert!(should_process(Path::new("src/App.tsx"), &[]));
        assert!(should_process(Path::new("src/components/Foo.jsx"), &[]));
    }

    #[test]
    fn should_process_rejects_non_jsx_family() {
        assert!(!should_process(Path::new("src/App.ts"), &[]));
        assert!(!should_process(Path::new("src/App.css"), &[]));
    }

    #[test]
    fn should_process_rejects_node_modules() {
        assert!(!should_process(
            Path::new("node_modules/react/index.tsx"),
            &[]
        ));
    }

    #[test]
    fn should_process_honours_exclude_list() {
        assert!(!should_process(
            Path::new("src/generated/Foo.tsx"),
            &["generated".to_string()]
        ));
    }

    #[test]
    fn tags_native_elements_with_four_attributes() {
        let src = "const App = () => <div><span>x</span></div>;";
        let result = transform_source("/src/App.tsx", src, &TaggerConfig::default()).unwrap();
        for attr in ["data-jsx-id", "data-jsx-file", "data-jsx-line", "data-jsx-col"] {
            assert!(has_attr(&result.code, attr), "missing {attr} in: {}", result.code);
        }
        assert_eq!(result.entries.len(), 2);
    }

    #[test]
    fn skips_component_tags() {
        let src = "const App = () => <MyComponent />;";
        let result = transform_source("/src/App.tsx", src, &TaggerConfig::default()).unwrap();
        assert!(result.entries.is_empty());
        assert!(!has_attr(&result.code, "data-jsx-id"));
    }

    #[test]
    fn two_sibling_elements_get_distinct_ids() {
        let src = "const App = () => <div><span>x</span></div>;";
        let result = transform_source("/src/App.tsx", src, &TaggerConfig::default()).unwrap();
        let ids: Vec<&String> = result.entries.iter().map(|(id, _)| id).collect();
        assert_ne!(ids[0], ids[1]);
    }

    #[test]
    fn loop_without_index_param_gets_dynamic_id() {
        let src = "const List = (items) => items.map((item) => <li>{item}</li>);";
        let result = transform_source("/src/List.tsx", src, &TaggerConfig::default()).unwrap();
        assert!(result.code.contains(SYNTHETIC_INDEX_IDENT));
        assert!(result.code.contains("data-jsx-id"));
        // dynamic id is a template expression, not a bare string literal
        assert!(result.code.contains("__jsx_idx__"));
    }

    #[test]
    fn loop_with_existing_index_param_reuses_it() {
        let src = "const List = (items) => items.map((item, idx) => <li key={idx}>{item}</li>);";
        let result = transform_source("/src/List.tsx", src, &TaggerConfig::default()).unwrap();
        assert!(!result.code.contains(SYNTHETIC_INDEX_IDENT));
        assert!(result.code.contains("idx"));
    }

    #[test]
    fn id_prefix_is_applied() {
        let src = "const App = () => <div>x</div>;";
        let cfg = TaggerConfig {
            id_prefix: Some("demo".to_string()),
            exclude: vec![],
        };
        let result = transform_source("/src/App.tsx", src, &cfg).unwrap();
        let (id, _) = &result.entries[0];
        assert!(id.starts_with("demo-"));
    }

    #[test]
    fn idempotent_on_already_tagged_source() {
        let src = "const App = () => <div>x</div>;";
        let first = transform_source("/src/App.tsx", src, &TaggerConfig::default()).unwrap();
        let second = transform_source("/src/App.tsx", &first.code, &TaggerConfig::default()).unwrap();
        assert_eq!(first.entries.len(), second.entries.len());
        // No duplicated data-jsx-id attribute on re-transform.
        let occurrences = second.code.matches("data-jsx-id").count();
        assert_eq!(occurrences, 1);
    }
}
