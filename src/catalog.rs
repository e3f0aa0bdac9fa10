use crate::model::{PlaceCategory, PlaceRecord};

const SAMPLE_SHOPS: &[(&str, PlaceCategory, f64, f64, &str)] = &[
    ("Sola Coffee", PlaceCategory::Coffee, 35.7796, -78.6382, "119 E Hargett St, Raleigh, NC"),
    ("Jubala Village", PlaceCategory::Bakery, 35.7831, -78.6811, "4450 Glen Forest Dr, Raleigh, NC"),
    ("Black Dog Coffee", PlaceCategory::Coffee, 35.7721, -78.6388, "3800 Glenwood Ave, Raleigh, NC"),
    ("Café Helios", PlaceCategory::Coffee, 35.7866, -78.6445, "413 Glenwood Ave, Raleigh, NC"),
    ("Morning Times", PlaceCategory::Coffee, 35.7887, -78.6576, "10 E Martin St, Raleigh, NC"),
    ("Cup A Joe", PlaceCategory::Coffee, 35.7943, -78.6564, "2801 Hillsborough St, Raleigh, NC"),
    ("Bean Traders", PlaceCategory::Coffee, 35.9940, -78.8986, "1010 9th St, Durham, NC"),
    ("Cocoa Cinnamon", PlaceCategory::Coffee, 35.9965, -78.9017, "420 W Geer St, Durham, NC"),
    ("Joe Van Gogh", PlaceCategory::Coffee, 36.0014, -78.9106, "236 W Main St, Durham, NC"),
    ("Dune Coffee", PlaceCategory::Coffee, 35.9876, -78.9051, "305 E Chapel Hill St, Durham, NC"),
    ("Carolina Coffee Shop", PlaceCategory::Coffee, 35.9132, -79.0558, "138 E Franklin St, Chapel Hill, NC"),
    ("Caffe Driade", PlaceCategory::Coffee, 35.9101, -79.0625, "1215 E Franklin St, Chapel Hill, NC"),
    ("Global Village Coffee", PlaceCategory::Coffee, 35.7596, -78.7767, "230 E Chatham St, Cary, NC"),
];

/// Hand-curated Triangle-area shops the crew already knows about.
pub fn sample_shops() -> Vec<PlaceRecord> {
    SAMPLE_SHOPS
        .iter()
        .map(|(name, category, lat, lng, address)| {
            PlaceRecord::sample(name, *category, *lat, *lng, address)
        })
        .collect()
}
