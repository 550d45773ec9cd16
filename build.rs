use vergen::EmitBuilder;

fn main() {
    // 生成构建信息，供 --version 显示构建时间
    EmitBuilder::builder()
        .build_timestamp()
        .emit()
        .expect("Failed to generate build information");
}
