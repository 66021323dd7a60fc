//! Test attributes that fail a test instead of hanging it.
//!
//! `#[test_timeout::timeout]` wraps a synchronous test, `#[test_timeout::tokio_timeout_test]`
//! an async one. Both accept a bare number of seconds (`#[timeout(5)]`) or named
//! options:
//!
//! ```ignore
//! #[test_timeout::timeout(millis = 1500)]
//! fn quick() {}
//!
//! #[test_timeout::tokio_timeout_test(secs = 10, flavor = "multi_thread", worker_threads = 2)]
//! async fn threaded() -> Result<(), Box<dyn std::error::Error>> { Ok(()) }
//! ```
//!
//! Tests may return `()` or any `Result<_, E: Debug>`; an `Err` fails the test with
//! the debug rendering of the error.

use proc_macro::TokenStream;
use proc_macro2::{Span, TokenStream as TokenStream2};
use quote::{format_ident, quote};
use syn::parse::Parser;
use syn::punctuated::Punctuated;
use syn::{Attribute, Expr, ExprLit, ItemFn, Lit, LitInt, MetaNameValue, ReturnType, Token};

const DEFAULT_TIMEOUT_MS: u64 = 60_000;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flavor {
    CurrentThread,
    MultiThread,
}

struct Options {
    timeout_ms: u64,
    flavor: Flavor,
    worker_threads: Option<usize>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            flavor: Flavor::CurrentThread,
            worker_threads: None,
        }
    }
}

fn parse_options(attr: TokenStream, runtime_options: bool) -> syn::Result<Options> {
    let mut options = Options::default();
    if attr.is_empty() {
        return Ok(options);
    }

    if let Ok(secs) = syn::parse::<LitInt>(attr.clone()) {
        options.timeout_ms = secs.base10_parse::<u64>()?.saturating_mul(1000);
        return validate(options, Span::call_site());
    }

    let pairs = Punctuated::<MetaNameValue, Token![,]>::parse_terminated.parse(attr)?;
    for pair in &pairs {
        let Some(key) = pair.path.get_ident() else {
            return Err(syn::Error::new_spanned(&pair.path, "expected a plain option name"));
        };
        match key.to_string().as_str() {
            "secs" => options.timeout_ms = int_value(&pair.value)?.saturating_mul(1000),
            "millis" => options.timeout_ms = int_value(&pair.value)?,
            "flavor" if runtime_options => {
                options.flavor = match str_value(&pair.value)?.as_str() {
                    "current_thread" => Flavor::CurrentThread,
                    "multi_thread" => Flavor::MultiThread,
                    _ => {
                        return Err(syn::Error::new_spanned(
                            &pair.value,
                            "flavor must be \"current_thread\" or \"multi_thread\"",
                        ))
                    }
                }
            }
            "worker_threads" if runtime_options => {
                let threads = int_value(&pair.value)?;
                if threads == 0 {
                    return Err(syn::Error::new_spanned(
                        &pair.value,
                        "worker_threads must be greater than zero",
                    ));
                }
                options.worker_threads = Some(threads as usize);
            }
            _ => return Err(syn::Error::new_spanned(key, "unknown option")),
        }
    }

    if options.worker_threads.is_some() && options.flavor != Flavor::MultiThread {
        return Err(syn::Error::new(
            Span::call_site(),
            "worker_threads requires flavor = \"multi_thread\"",
        ));
    }
    validate(options, Span::call_site())
}

fn validate(options: Options, span: Span) -> syn::Result<Options> {
    if options.timeout_ms == 0 {
        return Err(syn::Error::new(span, "timeout must be greater than zero"));
    }
    Ok(options)
}

fn int_value(expr: &Expr) -> syn::Result<u64> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Int(value),
            ..
        }) => value.base10_parse(),
        other => Err(syn::Error::new_spanned(other, "expected an integer literal")),
    }
}

fn str_value(expr: &Expr) -> syn::Result<String> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Str(value),
            ..
        }) => Ok(value.value()),
        other => Err(syn::Error::new_spanned(other, "expected a string literal")),
    }
}

/// Maps the body's return value to `Result<(), String>` so it can cross threads.
fn report(output: &ReturnType, value: TokenStream2) -> TokenStream2 {
    match output {
        ReturnType::Default => quote! {{
            let () = #value;
            ::std::result::Result::<(), ::std::string::String>::Ok(())
        }},
        ReturnType::Type(..) => quote! {
            match #value {
                ::std::result::Result::Ok(_) => ::std::result::Result::<(), ::std::string::String>::Ok(()),
                ::std::result::Result::Err(err) => ::std::result::Result::Err(format!("{err:?}")),
            }
        },
    }
}

/// Runs `run` (an expression yielding `Result<(), String>`) on a named thread and
/// waits at most `timeout_ms` for it.
fn supervise(name: &syn::Ident, timeout_ms: u64, run: TokenStream2) -> TokenStream2 {
    quote! {
        let limit = ::std::time::Duration::from_millis(#timeout_ms);
        let (sender, receiver) = ::std::sync::mpsc::channel();
        let spawned = ::std::thread::Builder::new()
            .name(stringify!(#name).to_string())
            .spawn(move || {
                let result = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| #run));
                let _ = sender.send(result);
            });
        if let Err(err) = spawned {
            panic!("failed to spawn test thread: {err}");
        }
        match receiver.recv_timeout(limit) {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(message))) => panic!("test returned an error: {message}"),
            Ok(Err(payload)) => ::std::panic::resume_unwind(payload),
            Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("test timed out after {limit:?}")
            }
            Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread exited before reporting a result")
            }
        }
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = match parse_options(attr, true) {
        Ok(options) => options,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = syn::parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }

    let name = sig.ident.clone();
    let body = format_ident!("__{}_body", name);
    let output = sig.output.clone();
    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr) && !is_test_attribute(attr))
        .collect();

    let builder = match (options.flavor, options.worker_threads) {
        (Flavor::CurrentThread, _) => quote! { ::tokio::runtime::Builder::new_current_thread() },
        (Flavor::MultiThread, Some(threads)) => quote! {{
            let mut builder = ::tokio::runtime::Builder::new_multi_thread();
            builder.worker_threads(#threads);
            builder
        }},
        (Flavor::MultiThread, None) => quote! { ::tokio::runtime::Builder::new_multi_thread() },
    };
    let timeout_ms = options.timeout_ms;
    let finished = report(&output, quote! { value });
    let run = quote! {{
        let runtime = match #builder.enable_all().build() {
            Ok(runtime) => runtime,
            Err(err) => panic!("failed to build Tokio runtime: {err}"),
        };
        runtime.block_on(async {
            let limit = ::std::time::Duration::from_millis(#timeout_ms);
            match ::tokio::time::timeout(limit, #body()).await {
                Ok(value) => #finished,
                Err(_) => panic!("test timed out after {limit:?}"),
            }
        })
    }};
    let supervised = supervise(&name, timeout_ms, run);

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis fn #name() {
            async fn #body() #output #block
            #supervised
        }
    })
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = match parse_options(attr, false) {
        Ok(options) => options,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = syn::parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function",
        )
        .to_compile_error()
        .into();
    }

    let name = sig.ident.clone();
    let body = format_ident!("__{}_body", name);
    let output = sig.output.clone();
    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_attribute(attr))
        .collect();
    let run = report(&output, quote! { #body() });
    let supervised = supervise(&name, options.timeout_ms, run);

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis fn #name() {
            fn #body() #output #block
            #supervised
        }
    })
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}

fn is_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!((segments.next(), segments.next()), (Some(first), None) if first.ident == "test")
}
