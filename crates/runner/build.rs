//! Build script for InstanceGuard.Runner
//! Embeds Windows resource metadata

fn main() {
    #[cfg(windows)]
    {
        let mut res = winresource::WindowsResource::new();
        res.set("FileDescription", "InstanceGuard.Runner");
        res.set("ProductName", "Instance Guard");
        res.set("InternalName", "InstanceGuard.Runner");
        res.set("OriginalFilename", "InstanceGuard_Runner.exe");
        res.set("ProductVersion", env!("CARGO_PKG_VERSION"));
        res.set("FileVersion", env!("CARGO_PKG_VERSION"));

        if let Err(e) = res.compile() {
            println!("cargo:warning=Failed to compile Windows resources: {}", e);
        }
    }
}
