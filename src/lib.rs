pub mod convert;
pub mod loaders;

// Re-export common types
pub use convert::{
    convert_ldm_bert_checkpoint, convert_ldm_unet_checkpoint, create_unet_config, BertConfig,
    ConvertError, FlatCheckpoint, LdmConfig, UNetConfig,
};

pub mod logging {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    pub fn init_logger() {
        Builder::new()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] - {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.args()
                )
            })
            .filter(None, LevelFilter::Info)
            .init();
    }
}
