pub mod ata;
pub mod block;
pub mod kbd;
pub mod shutdown;
pub mod timer;

pub fn init() {
    ata::init();
}
