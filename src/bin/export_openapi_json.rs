use lms_server::api::get_openapi_json;

fn main() -> anyhow::Result<()> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or("openapi.json".to_string());
    let json = get_openapi_json()?;
    std::fs::write(&path, json)?;
    println!("wrote {path}");
    Ok(())
}
