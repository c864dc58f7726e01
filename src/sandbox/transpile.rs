use deno_ast::swc::ast::{Decl, ModuleItem, ObjectPatProp, Pat, Stmt, VarDeclKind};
use deno_ast::swc::utils::contains_top_level_await;
use deno_ast::{
    EmitOptions, MediaType, ModuleSpecifier, ParseParams, ProgramRef, SourceMapOption,
    SourceRangedForSpanned, StartSourcePos, TranspileModuleOptions, TranspileOptions,
};

use super::Language;
use crate::output::ErrorOutput;

/// Turns cell source into a JavaScript script the engine can evaluate.
///
/// TypeScript has its types stripped; no type checking happens. Cells that
/// use top-level `await` are rewritten into an async function whose
/// top-level bindings are declared in the global scope, so they persist
/// across cells like any other top-level declaration. Everything else runs
/// as written.
pub fn to_javascript(code: &str, language: Language, filename: &str) -> Result<String, ErrorOutput> {
    let javascript = match language {
        Language::Js => code.to_string(),
        Language::Ts => strip_types(code, filename)?,
    };
    wrap_top_level_await(&javascript, filename)
}

fn specifier(filename: &str) -> Result<ModuleSpecifier, ErrorOutput> {
    ModuleSpecifier::parse(filename)
        .or_else(|_| ModuleSpecifier::parse("file:///cell.js"))
        .map_err(|e| compile_error(e.to_string()))
}

fn strip_types(code: &str, filename: &str) -> Result<String, ErrorOutput> {
    let parsed = deno_ast::parse_module(ParseParams {
        specifier: specifier(filename)?,
        text: code.into(),
        media_type: MediaType::TypeScript,
        capture_tokens: false,
        scope_analysis: false,
        maybe_syntax: None,
    })
    .map_err(|diagnostic| compile_error(diagnostic.to_string()))?;

    let emitted = parsed
        .transpile(
            &TranspileOptions::default(),
            &TranspileModuleOptions::default(),
            &EmitOptions {
                source_map: SourceMapOption::None,
                ..Default::default()
            },
        )
        .map_err(|e| compile_error(e.to_string()))?
        .into_source();

    Ok(emitted.text)
}

// ── Top-level await ───────────────────────────────────────

fn wrap_top_level_await(code: &str, filename: &str) -> Result<String, ErrorOutput> {
    let Ok(parsed) = deno_ast::parse_module(ParseParams {
        specifier: specifier(filename)?,
        text: code.into(),
        media_type: MediaType::JavaScript,
        capture_tokens: false,
        scope_analysis: false,
        maybe_syntax: None,
    }) else {
        // Sloppy-mode scripts and syntax errors are left for the engine to report
        return Ok(code.to_string());
    };
    let ProgramRef::Module(module) = parsed.program_ref() else {
        return Ok(code.to_string());
    };
    if !contains_top_level_await(module) {
        return Ok(code.to_string());
    }

    let mut lets: Vec<String> = Vec::new();
    let mut vars: Vec<String> = Vec::new();
    let mut functions = String::new();
    let mut body = String::new();
    let mut cursor = 0;
    let last = module.body.len().saturating_sub(1);

    for (index, item) in module.body.iter().enumerate() {
        let range = byte_range(item);
        body.push_str(&code[cursor..range.start]);
        cursor = range.end;

        let stmt = match item {
            ModuleItem::Stmt(stmt) => stmt,
            ModuleItem::ModuleDecl(_) => {
                return Err(compile_error(
                    "import and export declarations are not supported in cells; use require()"
                        .to_string(),
                ))
            }
        };

        match stmt {
            Stmt::Decl(Decl::Var(declaration)) => {
                let names = if declaration.kind == VarDeclKind::Var {
                    &mut vars
                } else {
                    &mut lets
                };
                for declarator in &declaration.decls {
                    bound_names(&declarator.name, names);
                    if let Some(init) = &declarator.init {
                        body.push_str(&format!(
                            "void ({} = {});",
                            source_of(code, &declarator.name),
                            source_of(code, &**init)
                        ));
                    }
                }
            }
            Stmt::Decl(Decl::Fn(function)) => {
                let name = function.ident.sym.to_string();
                // Declarations hoist, so assign before anything else runs
                functions.push_str(&format!("{name} = {};\n", source_of(code, stmt)));
                push_unique(&mut vars, name);
            }
            Stmt::Decl(Decl::Class(class)) => {
                let name = class.ident.sym.to_string();
                body.push_str(&format!("{name} = {};", source_of(code, stmt)));
                push_unique(&mut lets, name);
            }
            Stmt::Expr(expression) if index == last => {
                body.push_str(&format!("return ({});", source_of(code, &*expression.expr)));
            }
            _ => body.push_str(&code[range]),
        }
    }
    body.push_str(&code[cursor..]);

    let mut script = String::new();
    if !lets.is_empty() {
        script.push_str(&format!("let {};\n", lets.join(", ")));
    }
    if !vars.is_empty() {
        script.push_str(&format!("var {};\n", vars.join(", ")));
    }
    script.push_str("(async () => {\n");
    script.push_str(&functions);
    script.push_str(&body);
    script.push_str("\n})()");
    Ok(script)
}

fn byte_range<N: SourceRangedForSpanned>(node: &N) -> std::ops::Range<usize> {
    node.range().as_byte_range(StartSourcePos::START_SOURCE_POS)
}

fn source_of<'a, N: SourceRangedForSpanned>(code: &'a str, node: &N) -> &'a str {
    &code[byte_range(node)]
}

fn push_unique(names: &mut Vec<String>, name: String) {
    if !names.contains(&name) {
        names.push(name);
    }
}

/// Names a declaration pattern binds, destructuring included.
fn bound_names(pattern: &Pat, names: &mut Vec<String>) {
    match pattern {
        Pat::Ident(binding) => push_unique(names, binding.id.sym.to_string()),
        Pat::Array(array) => {
            for element in array.elems.iter().flatten() {
                bound_names(element, names);
            }
        }
        Pat::Object(object) => {
            for prop in &object.props {
                match prop {
                    ObjectPatProp::KeyValue(pair) => bound_names(&pair.value, names),
                    ObjectPatProp::Assign(assign) => push_unique(names, assign.key.id.sym.to_string()),
                    ObjectPatProp::Rest(rest) => bound_names(&rest.arg, names),
                }
            }
        }
        Pat::Rest(rest) => bound_names(&rest.arg, names),
        Pat::Assign(assign) => bound_names(&assign.left, names),
        Pat::Invalid(_) | Pat::Expr(_) => {}
    }
}

fn compile_error(message: String) -> ErrorOutput {
    let traceback = message.lines().map(str::to_string).collect();
    let headline = message.lines().next().unwrap_or_default().to_string();
    ErrorOutput::new("CompileError", headline).with_traceback(traceback)
}
