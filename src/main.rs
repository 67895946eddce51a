const DEMO_TEMPLATE: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/src/demo.html"));

use std::error::Error;
use std::rc::Rc;
use std::time::Duration;

use kizuna::{BinderConfig, DerivedValue, LiveModel, LiveObject, MemoryDom, TreeBinder, Value};
use log::{error, info};
use serde::Serialize;

#[derive(Debug, Clone, Default, LiveModel)]
#[live_model(type_name = "Profile")]
struct Profile {
    name: String,
    age: u32,
    subscribed: bool,
    tags: Vec<String>,
}

// 起動時に流し込む初期データ
#[derive(Serialize)]
struct Seed {
    name: String,
    age: u32,
    tags: Vec<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli_args = kizuna::parse_args();
    kizuna::init_logger(&cli_args.log_level);

    let local = tokio::task::LocalSet::new();
    if let Err(e) = local.run_until(run(cli_args)).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli_args: kizuna::CliArgs) -> Result<(), Box<dyn Error>> {
    let profile = LiveObject::from_model(Profile::default());
    let seed = Seed {
        name: "Kizuna".to_string(),
        age: 40,
        tags: vec!["rust".to_string(), "bindings".to_string()],
    };
    profile.load_json(&serde_json::to_value(&seed)?);

    profile.add_derived("summary", &["name", "age"], |v| {
        Value::from(format!("{} is {} years old", v[0], v[1]))
    })?;

    let subscribed = profile
        .property("subscribed")
        .ok_or("profile has no `subscribed` property")?;
    profile.add_derived_value(
        "status",
        DerivedValue::new_async("status", vec![subscribed], |v| {
            let subscribed = v[0].truthy();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Value::from(if subscribed { "subscribed" } else { "not subscribed" })
            }
        }),
    );

    profile.add_method("birthday", |this, _event| {
        let age = this.get("age").and_then(|v| v.as_number()).unwrap_or(0.0);
        this.set("age", age + 1.0);
        info!("happy birthday, {}", this.property_string("name"));
    });

    let dom = Rc::new(MemoryDom::new());
    let root = match &cli_args.template {
        Some(path) => kizuna::load_template(dom.as_ref(), path, cli_args.enable_lint, cli_args.quiet)?,
        None => kizuna::load_embedded_template(dom.as_ref(), DEMO_TEMPLATE, cli_args.enable_lint, cli_args.quiet)?,
    };

    let mut binder = TreeBinder::new(dom.clone(), BinderConfig::default());
    binder.bind(&profile, root)?;
    println!("{}", dom.inner_html(root));

    if cli_args.template.is_none() {
        // ユーザー操作を模擬する
        let inputs = dom.find_all_by_tag(root, "input");
        if let &[name, age, checkbox] = inputs.as_slice() {
            dom.input(name, "value", "Kizuna Fan");
            dom.input(age, "value", "41");
            dom.input(checkbox, "checked", true);
        }
        if let Some(button) = profile.child("birthday") {
            dom.click(button);
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        println!("{}", dom.inner_html(root));
    }

    if cli_args.enable_debug {
        info!("model: {}", profile.to_json());
    }

    binder.unbind();
    Ok(())
}
