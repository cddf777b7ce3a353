use proc_macro::TokenStream;
use quote::quote;
use syn::{
    parse_macro_input, Attribute, Data, DeriveInput, Fields, GenericArgument, Lit, PathArguments,
    Type,
};

/// Derives `imgflow_sdk::ActionDefinition` for a typed parameter struct.
///
/// ```ignore
/// #[derive(Deserialize, ActionParams)]
/// #[action(id = "resize", name = "Resize", description = "Scale images", category = "transform")]
/// struct ResizeParams {
///     #[param(label = "Width", min = "1")]
///     width: u32,
///     #[param(label = "Height")]
///     height: Option<u32>,
/// }
/// ```
#[proc_macro_derive(ActionParams, attributes(action, param))]
pub fn derive_action_params(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    let action_meta = extract_action_meta(&input.attrs);

    let param_schemas: Vec<proc_macro2::TokenStream> = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => fields
                .named
                .iter()
                .map(|f| {
                    let name = f.ident.as_ref().unwrap().to_string();
                    let meta = extract_param_meta(&f.attrs);
                    let param_type = meta
                        .param_type_override()
                        .unwrap_or_else(|| infer_param_type(&f.ty, &meta));
                    let default = default_token(meta.default.as_deref());
                    let required =
                        !is_option_type(&f.ty) && meta.default.is_none() && !has_serde_default(&f.attrs);
                    let label = if meta.label.is_empty() {
                        name.replace('_', " ")
                    } else {
                        meta.label.clone()
                    };
                    let description = &meta.description;

                    quote! {
                        imgflow_sdk::ParamSchema {
                            name: #name.to_string(),
                            label: #label.to_string(),
                            description: #description.to_string(),
                            param_type: #param_type,
                            required: #required,
                            default: #default,
                        }
                    }
                })
                .collect(),
            Fields::Unit => Vec::new(),
            _ => panic!("ActionParams only supports named fields"),
        },
        _ => panic!("ActionParams only supports structs"),
    };

    let struct_name = &input.ident;
    let id = &action_meta.id;
    let name = &action_meta.name;
    let description = &action_meta.description;
    let category = &action_meta.category;
    let scope = match action_meta.scope.as_str() {
        "batch" => quote! { imgflow_sdk::StepScope::Batch },
        _ => quote! { imgflow_sdk::StepScope::PerImage },
    };

    let expanded = quote! {
        impl imgflow_sdk::ActionDefinition for #struct_name {
            fn schema() -> imgflow_sdk::ActionSchema {
                imgflow_sdk::ActionSchema {
                    metadata: imgflow_sdk::ActionMetadata {
                        id: #id.to_string(),
                        name: #name.to_string(),
                        description: #description.to_string(),
                        category: #category.to_string(),
                    },
                    scope: #scope,
                    params: vec![#(#param_schemas),*],
                }
            }
        }
    };

    TokenStream::from(expanded)
}

struct ActionMeta {
    id: String,
    name: String,
    description: String,
    category: String,
    scope: String,
}

fn extract_action_meta(attrs: &[Attribute]) -> ActionMeta {
    for attr in attrs {
        if attr.path().is_ident("action") {
            let mut meta_out = ActionMeta {
                id: String::new(),
                name: String::new(),
                description: String::new(),
                category: "general".to_string(),
                scope: "per_image".to_string(),
            };

            let _ = attr.parse_nested_meta(|meta| {
                let value = meta.value()?;
                let lit: Lit = value.parse()?;
                let Lit::Str(s) = lit else {
                    return Ok(());
                };
                if meta.path.is_ident("id") {
                    meta_out.id = s.value();
                } else if meta.path.is_ident("name") {
                    meta_out.name = s.value();
                } else if meta.path.is_ident("description") {
                    meta_out.description = s.value();
                } else if meta.path.is_ident("category") {
                    meta_out.category = s.value();
                } else if meta.path.is_ident("scope") {
                    meta_out.scope = s.value();
                }
                Ok(())
            });

            if meta_out.id.is_empty() {
                panic!("#[action(...)] requires an `id`");
            }
            if meta_out.name.is_empty() {
                meta_out.name = meta_out.id.clone();
            }
            return meta_out;
        }
    }

    panic!("Missing #[action(...)] attribute");
}

#[derive(Default)]
struct ParamMeta {
    label: String,
    description: String,
    param_type: Option<String>,
    min: Option<String>,
    max: Option<String>,
    options: Option<String>,
    default: Option<String>,
}

impl ParamMeta {
    fn param_type_override(&self) -> Option<proc_macro2::TokenStream> {
        let ty = self.param_type.as_deref()?;
        Some(match ty {
            "text" => quote! { imgflow_sdk::ParamType::Text },
            "path" => quote! { imgflow_sdk::ParamType::Path },
            "boolean" => quote! { imgflow_sdk::ParamType::Boolean },
            "list" => quote! { imgflow_sdk::ParamType::List },
            "object" => quote! { imgflow_sdk::ParamType::Object },
            "integer" => self.integer_type(),
            "float" => self.float_type(),
            "select" => {
                let options: Vec<String> = self
                    .options
                    .as_deref()
                    .unwrap_or_default()
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                quote! { imgflow_sdk::ParamType::Select { options: vec![#(#options.to_string()),*] } }
            }
            other => panic!("unknown param type `{}`", other),
        })
    }

    fn integer_type(&self) -> proc_macro2::TokenStream {
        let min = option_token(self.min.as_deref().and_then(|s| s.parse::<i64>().ok()));
        let max = option_token(self.max.as_deref().and_then(|s| s.parse::<i64>().ok()));
        quote! { imgflow_sdk::ParamType::Integer { min: #min, max: #max } }
    }

    fn float_type(&self) -> proc_macro2::TokenStream {
        let min = option_token(self.min.as_deref().and_then(|s| s.parse::<f64>().ok()));
        let max = option_token(self.max.as_deref().and_then(|s| s.parse::<f64>().ok()));
        quote! { imgflow_sdk::ParamType::Float { min: #min, max: #max } }
    }
}

fn option_token<T: quote::ToTokens>(value: Option<T>) -> proc_macro2::TokenStream {
    match value {
        Some(v) => quote! { Some(#v) },
        None => quote! { None },
    }
}

fn extract_param_meta(attrs: &[Attribute]) -> ParamMeta {
    let mut out = ParamMeta::default();

    for attr in attrs {
        if attr.path().is_ident("param") {
            let _ = attr.parse_nested_meta(|meta| {
                let value = meta.value()?;
                let lit: Lit = value.parse()?;
                let Lit::Str(s) = lit else {
                    return Ok(());
                };
                if meta.path.is_ident("label") {
                    out.label = s.value();
                } else if meta.path.is_ident("description") {
                    out.description = s.value();
                } else if meta.path.is_ident("type") {
                    out.param_type = Some(s.value());
                } else if meta.path.is_ident("min") {
                    out.min = Some(s.value());
                } else if meta.path.is_ident("max") {
                    out.max = Some(s.value());
                } else if meta.path.is_ident("options") {
                    out.options = Some(s.value());
                } else if meta.path.is_ident("default") {
                    out.default = Some(s.value());
                }
                Ok(())
            });
        }
    }

    out
}

/// Defaults are written as strings; anything that parses as JSON keeps its JSON type.
fn default_token(default: Option<&str>) -> proc_macro2::TokenStream {
    match default {
        Some(raw) => quote! {
            Some(
                imgflow_sdk::serde_json::from_str::<imgflow_sdk::serde_json::Value>(#raw)
                    .unwrap_or_else(|_| imgflow_sdk::serde_json::Value::String(#raw.to_string()))
            )
        },
        None => quote! { None },
    }
}

fn infer_param_type(ty: &Type, meta: &ParamMeta) -> proc_macro2::TokenStream {
    if let Type::Path(type_path) = ty {
        if let Some(segment) = type_path.path.segments.last() {
            if segment.ident == "Option" {
                if let PathArguments::AngleBracketed(args) = &segment.arguments {
                    if let Some(GenericArgument::Type(inner_ty)) = args.args.first() {
                        return infer_param_type_inner(inner_ty, meta);
                    }
                }
            } else {
                return infer_param_type_inner(ty, meta);
            }
        }
    }

    quote! { imgflow_sdk::ParamType::Text }
}

fn infer_param_type_inner(ty: &Type, meta: &ParamMeta) -> proc_macro2::TokenStream {
    let Type::Path(type_path) = ty else {
        return quote! { imgflow_sdk::ParamType::Text };
    };
    let Some(segment) = type_path.path.segments.last() else {
        return quote! { imgflow_sdk::ParamType::Text };
    };

    match segment.ident.to_string().as_str() {
        "String" => quote! { imgflow_sdk::ParamType::Text },
        "PathBuf" => quote! { imgflow_sdk::ParamType::Path },
        "bool" => quote! { imgflow_sdk::ParamType::Boolean },
        "u8" | "u16" | "u32" | "u64" | "usize" | "i8" | "i16" | "i32" | "i64" | "isize" => {
            meta.integer_type()
        }
        "f32" | "f64" => meta.float_type(),
        "Vec" | "HashSet" | "BTreeSet" => quote! { imgflow_sdk::ParamType::List },
        "HashMap" | "BTreeMap" | "Map" | "Value" => quote! { imgflow_sdk::ParamType::Object },
        _ => quote! { imgflow_sdk::ParamType::Text },
    }
}

fn is_option_type(ty: &Type) -> bool {
    if let Type::Path(type_path) = ty {
        if let Some(segment) = type_path.path.segments.last() {
            return segment.ident == "Option";
        }
    }
    false
}

fn has_serde_default(attrs: &[Attribute]) -> bool {
    attrs.iter().any(|attr| {
        if !attr.path().is_ident("serde") {
            return false;
        }
        let mut found = false;
        let _ = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("default") {
                found = true;
            }
            if meta.input.peek(syn::Token![=]) {
                let _ = meta.value()?.parse::<Lit>()?;
            }
            Ok(())
        });
        found
    })
}
