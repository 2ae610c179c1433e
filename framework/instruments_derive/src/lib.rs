use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, FnArg, ItemFn, LitStr, ReturnType};

/// Time a method as a named atomic action of the iteration it runs in.
///
/// The method must take `self` by reference, belong to a type implementing `AtomicActionsHost` and
/// return an `anyhow::Result`. An `Err` return is recorded against the action.
///
/// ```ignore
/// #[atomic_action("heat.create_stack")]
/// fn create_stack(&mut self, template: &str) -> anyhow::Result<Stack> {
///     ...
/// }
/// ```
#[proc_macro_attribute]
pub fn atomic_action(args: TokenStream, input: TokenStream) -> TokenStream {
    let name = parse_macro_input!(args as LitStr);
    let mut input = parse_macro_input!(input as ItemFn);

    if let Some(asyncness) = &input.sig.asyncness {
        return syn::Error::new_spanned(asyncness, "atomic actions cannot be async")
            .to_compile_error()
            .into();
    }

    if !matches!(input.sig.inputs.first(), Some(FnArg::Receiver(_))) {
        return syn::Error::new_spanned(&input.sig, "atomic actions must be methods taking self")
            .to_compile_error()
            .into();
    }

    let ret_ty = match &input.sig.output {
        ReturnType::Type(_, ty) => ty.clone(),
        ReturnType::Default => {
            return syn::Error::new_spanned(&input.sig, "atomic actions must return a Result")
                .to_compile_error()
                .into();
        }
    };

    let body = &input.block;
    input.block = syn::parse_quote!({
        let __atomic_timer = ::cloudbench_instruments::AtomicTimer::start(
            ::cloudbench_instruments::AtomicActionsHost::atomic_actions(&*self),
            #name,
        );
        #[allow(clippy::redundant_closure_call)]
        let __atomic_result: #ret_ty = (|| -> #ret_ty #body)();
        __atomic_timer.finish_with(&__atomic_result);
        __atomic_result
    });

    TokenStream::from(quote!(#input))
}
