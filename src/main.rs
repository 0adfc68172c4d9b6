//! loractl - USB LoRaWAN gateway installer and stack manager.

fn main() {
    if let Err(e) = loractl_lib::run() {
        e.exit();
    }
}
