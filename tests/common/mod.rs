use lazypatch::{CallerShape, ConstantTarget, LazyCall, LazyLinker, LinkerConfig};

/// Installs the shared linker; every test may call this.
pub fn linker() -> LazyLinker {
    LazyLinker::install(LinkerConfig::default()).expect("install lazy linker")
}

pub fn lazy_call(linker: &LazyLinker, value: i32, shape: CallerShape) -> LazyCall {
    linker
        .link(&ConstantTarget(value), shape)
        .expect("link lazy call")
}
