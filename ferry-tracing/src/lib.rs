extern crate proc_macro;

use proc_macro2::TokenStream;
use quote::{quote, quote_spanned};
use syn::{ItemFn, Stmt, parse::Parse, parse_macro_input, parse_quote};

#[derive(PartialEq, Eq, Clone, Copy, Default)]
enum Precision {
    #[default]
    Nanos,
    Micros,
    Millis,
    Seconds,
}

impl Precision {
    /// A closure expression rendering the elapsed time at this precision
    fn formatter(self) -> syn::Expr {
        match self {
            Self::Nanos => {
                parse_quote!(|d: std::time::Duration| format!("{} ns elapsed", d.as_nanos()))
            }
            Self::Micros => {
                parse_quote!(|d: std::time::Duration| format!("{} us elapsed", d.as_micros()))
            }
            Self::Millis => {
                parse_quote!(|d: std::time::Duration| format!("{} ms elapsed", d.as_millis()))
            }
            Self::Seconds => {
                parse_quote!(|d: std::time::Duration| format!("{} s elapsed", d.as_secs()))
            }
        }
    }
}

impl TryFrom<&syn::LitStr> for Precision {
    type Error = syn::Error;

    fn try_from(value: &syn::LitStr) -> Result<Self, Self::Error> {
        match value.value().as_str() {
            "ns" | "nano" | "nanos" | "nanoseconds" => Ok(Self::Nanos),
            "us" | "micro" | "micros" | "microseconds" => Ok(Self::Micros),
            "ms" | "milli" | "millis" | "milliseconds" => Ok(Self::Millis),
            "s" | "sec" | "secs" | "seconds" => Ok(Self::Seconds),
            other => Err(syn::Error::new(
                value.span(),
                format!("unknown precision `{other}`, expected one of ns, us, ms, s"),
            )),
        }
    }
}

impl Parse for Precision {
    fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
        if input.peek(syn::token::Paren) {
            let content;
            let _ = syn::parenthesized!(content in input);
            let _ = content.parse::<keywords::precision>()?;
            let _ = content.parse::<syn::Token![=]>()?;
            Self::try_from(&content.parse::<syn::LitStr>()?)
        } else {
            Ok(Self::default())
        }
    }
}

#[derive(Default)]
struct Attributes {
    timing: Option<Precision>,
    instrument: Option<TokenStream>,
    warnings: Vec<syn::Error>,
}

mod keywords {
    syn::custom_keyword!(timing);
    syn::custom_keyword!(precision);
    syn::custom_keyword!(instrument);
}

impl Attributes {
    fn warnings(&self) -> TokenStream {
        let warnings = self.warnings.iter().map(|err| {
            let msg = format!("found unrecognized input, {err}");
            let msg = syn::LitStr::new(&msg, err.span());

            quote_spanned! {err.span()=>
                #[warn(deprecated)]
                {
                    #[deprecated(since = "not actually deprecated", note = #msg)]
                    const TRACED_WARNING: () = ();
                    let () = TRACED_WARNING;
                }
            }
        });

        quote! {
            { #(#warnings)* }
        }
    }
}

impl Parse for Attributes {
    fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
        let mut attributes = Self::default();

        while !input.is_empty() {
            let lookahead = input.lookahead1();
            if lookahead.peek(keywords::timing) {
                if attributes.timing.is_some() {
                    return Err(input.error("expected only a single `timing` argument"));
                }

                let _ = input.parse::<keywords::timing>()?;
                attributes.timing = Some(input.parse()?);
            } else if lookahead.peek(keywords::instrument) {
                if attributes.instrument.is_some() {
                    return Err(input.error("expected only a single `instrument` argument"));
                }

                let _ = input.parse::<keywords::instrument>()?;
                if input.peek(syn::token::Paren) {
                    let content;
                    let _ = syn::parenthesized!(content in input);
                    attributes.instrument = Some(content.parse()?);
                } else {
                    attributes.instrument = Some(TokenStream::new());
                }
            } else if lookahead.peek(syn::Token![,]) {
                let _ = input.parse::<syn::Token![,]>()?;
            } else {
                attributes.warnings.push(lookahead.error());
                let _ = input.parse::<proc_macro2::TokenTree>();
            }
        }

        Ok(attributes)
    }
}

/// Adds `tracing::trace!` events at the start and end of the attributed
/// function.
///
/// * `instrument(...)` forwards its arguments to `#[tracing::instrument]`, so
///   the function body runs inside a span carrying those fields.
/// * `timing` or `timing(precision = "ms")` appends the elapsed time to the
///   exit event. Precision is one of `ns`, `us`, `ms` or `s`.
///
/// Works on both sync and async functions; for async functions the timer
/// starts on first poll.
#[proc_macro_attribute]
pub fn traced(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    let args = parse_macro_input!(args as Attributes);
    let warnings = args.warnings();

    let mut item_fn = parse_macro_input!(item as ItemFn);

    item_fn
        .attrs
        .push(parse_quote! { #[allow(clippy::items_after_statements)] });

    if let Some(fields) = &args.instrument {
        item_fn
            .attrs
            .push(parse_quote! { #[tracing::instrument(#fields)] });
    }

    let id = item_fn.sig.ident.to_string();
    let on_exit: Stmt = match args.timing {
        None => parse_quote! { tracing::trace!("OnExit: {}", #id); },
        Some(precision) => {
            let formatter = precision.formatter();
            parse_quote! {
                tracing::trace!("OnExit: {} ({})", #id, (#formatter)(self.timer.elapsed()));
            }
        }
    };

    let decl: Vec<Stmt> = parse_quote! {
        struct __Traced {
            timer: std::time::Instant,
        }

        impl __Traced {
            fn new() -> Self {
                #warnings

                tracing::trace!("OnEnter: {}", #id);
                Self {
                    timer: std::time::Instant::now(),
                }
            }
        }

        impl std::ops::Drop for __Traced {
            fn drop(&mut self) {
                #on_exit
            }
        }
    };

    let init: Stmt = parse_quote! { let __traced = __Traced::new(); };
    item_fn.block.stmts.insert(0, init);
    for stmt in decl.into_iter().rev() {
        item_fn.block.stmts.insert(0, stmt);
    }

    proc_macro::TokenStream::from(quote! { #item_fn })
}
