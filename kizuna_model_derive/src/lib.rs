use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Data, DeriveInput, Fields, LitStr, Type};

const COERCIONS: &[&str] = &["identity", "bool", "boolean", "number", "text", "string"];

#[proc_macro_derive(LiveModel, attributes(live_model, live))]
pub fn derive_live_model(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let struct_ident = input.ident;

    // #[live_model(crate_path="::kizuna", type_name="Person")]
    let mut crate_path = quote!(::kizuna);
    let mut type_name = struct_ident.to_string();
    for attr in &input.attrs {
        if !attr.path().is_ident("live_model") { continue; }
        let parsed = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("crate_path") {
                let s: LitStr = meta.value()?.parse()?;
                let ts: proc_macro2::TokenStream = s.value().parse().map_err(|_| meta.error("invalid crate_path"))?;
                crate_path = quote!(#ts);
            } else if meta.path.is_ident("type_name") {
                let s: LitStr = meta.value()?.parse()?;
                type_name = s.value();
            } else {
                return Err(meta.error("unknown live_model attribute"));
            }
            Ok(())
        });
        if let Err(e) = parsed {
            return e.to_compile_error().into();
        }
    }

    let Data::Struct(data_struct) = &input.data else {
        return quote! { compile_error!("LiveModel can only be derived for structs"); }.into();
    };
    let Fields::Named(fields_named) = &data_struct.fields else {
        return quote! { compile_error!("LiveModel requires named fields"); }.into();
    };

    struct F { ident: syn::Ident, key: String, coerce: Option<String>, raw: bool }

    // #[live(rename="alias", coerce="bool", raw, skip)]
    let mut fs: Vec<F> = Vec::new();
    for f in &fields_named.named {
        let Some(ident) = f.ident.clone() else { continue };
        let mut field = F {
            key: ident.to_string(),
            coerce: default_coercion(&f.ty).map(str::to_string),
            ident,
            raw: false,
        };
        let mut skip = false;
        for a in &f.attrs {
            if !a.path().is_ident("live") { continue; }
            let parsed = a.parse_nested_meta(|meta| {
                if meta.path.is_ident("rename") {
                    let s: LitStr = meta.value()?.parse()?;
                    field.key = s.value();
                } else if meta.path.is_ident("coerce") {
                    let s: LitStr = meta.value()?.parse()?;
                    if !COERCIONS.contains(&s.value().as_str()) {
                        return Err(meta.error(format!("unknown coercion `{}`", s.value())));
                    }
                    field.coerce = Some(s.value());
                } else if meta.path.is_ident("raw") {
                    field.raw = true;
                } else if meta.path.is_ident("skip") {
                    skip = true;
                } else {
                    return Err(meta.error("unknown live attribute"));
                }
                Ok(())
            });
            if let Err(e) = parsed {
                return e.to_compile_error().into();
            }
        }
        if !skip {
            fs.push(field);
        }
    }

    // ---- 型ヘルパ ----
    fn is_ty(ty: &Type, want: &str) -> bool {
        let actual_type = match ty {
            Type::Group(group) => &*group.elem,
            other => other,
        };
        match actual_type {
            Type::Path(tp) => tp.path.segments.last().map(|seg| seg.ident == want).unwrap_or(false),
            _ => false,
        }
    }
    // 型から既定の変換を選ぶ
    fn default_coercion(ty: &Type) -> Option<&'static str> {
        if is_ty(ty, "bool") {
            Some("bool")
        } else if is_ty(ty, "String") {
            Some("text")
        } else if ["i8", "i16", "i32", "i64", "u8", "u16", "u32", "u64", "usize", "isize", "f32", "f64"]
            .iter()
            .any(|n| is_ty(ty, n))
        {
            Some("number")
        } else {
            None
        }
    }

    let descriptors = fs.iter().map(|f| {
        let field = &f.ident;
        let key = &f.key;
        let ctor = if f.raw { quote!(raw) } else { quote!(live) };
        let descriptor = quote! {
            #crate_path::engine::object::PropertyDescriptor::#ctor(#key, self.#field)
        };
        match &f.coerce {
            Some(name) if !f.raw => quote! {
                #descriptor.with_coercion(
                    #crate_path::engine::live_value::Coercion::from_name(#name).unwrap_or_default()
                )
            },
            _ => descriptor,
        }
    });

    let expanded = quote! {
        impl #crate_path::engine::object::ModelSchema for #struct_ident {
            fn type_name() -> &'static str {
                #type_name
            }
            fn into_descriptors(self) -> ::std::vec::Vec<#crate_path::engine::object::PropertyDescriptor> {
                ::std::vec![#(#descriptors),*]
            }
        }
    };
    TokenStream::from(expanded)
}
