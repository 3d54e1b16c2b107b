use proc_macro::TokenStream;
use quote::quote;
use syn::{ItemFn, parse_macro_input};

/// Boots a `greenwait::Runtime` and blocks on the async `main` body.
#[proc_macro_attribute]
pub fn main(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);
    let name = &input.sig.ident;
    let body = &input.block;
    let attrs = &input.attrs;
    let vis = &input.vis;

    if input.sig.asyncness.is_none() {
        return quote! { compile_error!("The #[greenwait::main] function must be async"); }.into();
    }

    if name != "main" {
        return quote! {
            compile_error!("#[greenwait::main] can only be applied to the 'main' function");
        }
        .into();
    }

    let result = quote! {
        #(#attrs)*
        #vis fn main() {
            let runtime = match greenwait::runtime::Runtime::new() {
                Ok(runtime) => runtime,
                Err(err) => {
                    eprintln!("greenwait: failed to start runtime: {err}");
                    std::process::exit(1);
                }
            };

            runtime.block_on(async {
                #body
            });

            // Wake anything still parked before the process exits.
            runtime.shutdown();
        }
    };
    result.into()
}
